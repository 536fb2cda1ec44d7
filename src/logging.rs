use crate::Result;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber for the command-line front end.
///
/// `RUST_LOG` takes precedence over the verbosity flag when set.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default_directive = if verbose {
        "chunkvault=debug"
    } else {
        "chunkvault=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| crate::Error::Logging {
            reason: e.to_string(),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_second_init_reports_logging_error() {
        let _ = init_logging(false);
        let result = init_logging(true);
        assert!(matches!(result, Err(Error::Logging { .. })));
    }
}
