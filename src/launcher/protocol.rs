//! Line protocol spoken to the engine over its stdin.
//!
//! One UTF-8 command per line: the origin snapshot, then the target snapshot,
//! then any number of `run <N>` requests.

use std::fmt;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Origin(String),
    Target(String),
    /// Advance the simulation by N steps.
    Run(u32),
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLine::Origin(s) | ControlLine::Target(s) => f.write_str(s),
            ControlLine::Run(n) => write!(f, "run {n}"),
        }
    }
}

/// Write a single newline-terminated line and flush it.
pub async fn send_line<W>(w: &mut W, line: &ControlLine) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = line.to_string();
    buf.push('\n');
    w.write_all(buf.as_bytes()).await?;
    w.flush().await
}

/// Send the origin/target handshake and, when `autorun_steps > 0`, one
/// `run` request. Stops at the first failed write.
pub async fn send_handshake<W>(
    w: &mut W,
    origin: &str,
    target: &str,
    autorun_steps: u32,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_line(w, &ControlLine::Origin(origin.to_string())).await?;
    send_line(w, &ControlLine::Target(target.to_string())).await?;
    if autorun_steps > 0 {
        send_line(w, &ControlLine::Run(autorun_steps)).await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingInput;
    use super::*;

    #[test]
    fn run_line_format() {
        assert_eq!(ControlLine::Run(3).to_string(), "run 3");
        assert_eq!(ControlLine::Origin("base_the_ville".into()).to_string(), "base_the_ville");
    }

    #[tokio::test]
    async fn handshake_without_autorun() {
        let mut input = RecordingInput::new();
        send_handshake(&mut input, "sim_b", "auto_run_1", 0).await.unwrap();
        assert_eq!(input.lines(), vec!["sim_b", "auto_run_1"]);
    }

    #[tokio::test]
    async fn handshake_with_autorun_appends_one_run() {
        let mut input = RecordingInput::new();
        send_handshake(&mut input, "o", "t", 5).await.unwrap();
        assert_eq!(input.lines(), vec!["o", "t", "run 5"]);
    }

    #[tokio::test]
    async fn handshake_stops_at_first_failure() {
        let mut input = RecordingInput::failing_from(2);
        let err = send_handshake(&mut input, "o", "t", 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(input.lines(), vec!["o"]);
        assert_eq!(input.attempts(), 2);
    }
}
