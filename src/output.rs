/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// machine-readable output (`--json`) and human output share one path.
pub trait UserOutput: Send + Sync {
    /// Informational status message (e.g., "Stopping all services...")
    fn status(&self, message: &str);

    /// Success message (e.g., "All services started")
    fn success(&self, message: &str);

    /// Warning message
    fn warning(&self, message: &str);

    /// Error message
    fn error(&self, message: &str);
}

/// Standard CLI output: results on stdout, problems on stderr.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }
}
