//! Shell wrappers around the local snapshot command.

use std::process::Stdio;
use tokio::process::{Child, Command};

/// Wrap a command producing the snapshot stream so its output is compressed.
/// SIGTERM on the wrapper takes down the whole pipeline.
pub fn send_wrapper(cmd: &str, compress_cmd: &str) -> String {
    format!(
        "set -o pipefail; trap 'kill -HUP 0' SIGTERM; ({} | {};)&\\wait $!",
        cmd, compress_cmd
    )
}

/// Wrap a command consuming the snapshot stream so its input is decompressed.
/// Stdin is parked on fd 7 while the background job is set up.
pub fn receive_wrapper(cmd: &str, decompress_cmd: &str) -> String {
    format!(
        "trap 'kill -HUP 0' SIGTERM; exec 7<&0 0</dev/null; set -o pipefail; \
         (exec 0<&7 7<&-; {} | {} ;) & wait $!",
        decompress_cmd, cmd
    )
}

/// Launch `bash -c <script>` as the leader of its own process group.
pub fn spawn(script: &str, with_stdin: bool) -> std::io::Result<Child> {
    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(script)
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    command.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_wrapper() {
        assert_eq!(
            send_wrapper("thin_send pool/vol", "zstd"),
            "set -o pipefail; trap 'kill -HUP 0' SIGTERM; (thin_send pool/vol | zstd;)&\\wait $!"
        );
    }

    #[test]
    fn test_receive_wrapper() {
        assert_eq!(
            receive_wrapper("thin_recv pool/vol", "zstd -d"),
            "trap 'kill -HUP 0' SIGTERM; exec 7<&0 0</dev/null; set -o pipefail; \
             (exec 0<&7 7<&-; zstd -d | thin_recv pool/vol ;) & wait $!"
        );
    }

    #[tokio::test]
    async fn test_wrapped_command_keeps_exit_code() {
        let mut child = spawn(&send_wrapper("exit 4", "cat"), false).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(4));
    }
}
