use bollard::container::LogOutput;
use futures_util::{Stream, StreamExt};

/// Split a command line into argv.
///
/// Arguments are separated by whitespace; there is no quoting. Callers
/// that need arbitrary bytes in an argument must encode them first.
pub(crate) fn split_argv(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_owned).collect()
}

/// Drain an attached exec stream into one buffer, in arrival order.
pub(crate) async fn collect_output<S>(mut stream: S) -> Result<Vec<u8>, bollard::errors::Error>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut buf = Vec::new();
    while let Some(frame) = stream.next().await {
        match frame? {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::Console { message }
            | LogOutput::StdIn { message } => buf.extend_from_slice(&message),
        }
    }
    Ok(buf)
}
