use std::io::Write;
use std::process::{Command, Stdio};

/// What a finished command produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

/// The injected process-execution shim. The restore applier only ever runs
/// commands through this, so tests script it deterministically.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, ExecError>;
}

/// Runs commands on the host.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemRunner;

// === impl SystemRunner ===

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, ExecError> {
        let io = |source| ExecError::Io {
            program: program.to_string(),
            source,
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(io)?;
        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A broken pipe means the child stopped reading (e.g. `ipset
                // restore` bailing at a bad line); its exit status and stderr
                // carry the real story.
                if let Err(error) = pipe.write_all(bytes) {
                    if error.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(io(error));
                    }
                }
            }
        }
        let out = child.wait_with_output().map_err(io)?;

        if !out.status.success() {
            return Err(ExecError::Failed {
                program: program.to_string(),
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(Output {
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}
