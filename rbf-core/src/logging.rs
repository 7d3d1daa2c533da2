use env_logger::{Env, Target};
use rbf_error::{RbfError, RbfResult};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writes every record to stderr and to the run log.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // The file is the record of the run; a closed stderr must not lose it.
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// Truncate `log_path` and open it for appending.
///
/// Append mode keeps our records and the generated scripts' `&>>` output interleaved in
/// order.
pub fn open_log_file(log_path: &Path) -> RbfResult<File> {
    let artifact = |source| RbfError::Artifact {
        path: log_path.to_path_buf(),
        source,
    };
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(artifact)?;
    }
    File::create(log_path).map_err(artifact)?;
    OpenOptions::new()
        .append(true)
        .open(log_path)
        .map_err(artifact)
}

/// Initialise logging to stderr and `log_path`, `[LEVEL]  message` per line.
///
/// `RUST_LOG` overrides the default `info` filter. A second call keeps the first logger.
pub fn init(log_path: &Path) -> RbfResult<()> {
    let file = open_log_file(log_path)?;
    let result = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "[{:<5}]  {}", record.level(), record.args()))
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init();
    if let Err(err) = result {
        log::debug!("logger already initialised: {}", err);
    }
    Ok(())
}
