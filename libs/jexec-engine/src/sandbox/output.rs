use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-stream cap on captured program output
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[Output truncated]";

/// Accumulates output up to a byte cap, silently dropping the rest
#[derive(Debug)]
pub struct CappedOutput {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedOutput {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read `reader` to EOF, keeping at most `cap` bytes. Reading continues past
/// the cap so the writer never blocks on a full pipe.
pub async fn drain_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<CappedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut output = CappedOutput::new(cap);
    let Some(mut reader) = reader else {
        return Ok(output);
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        output.push(&chunk[..n]);
    }
    Ok(output)
}
