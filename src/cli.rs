use clap::Parser;
use std::path::PathBuf;

use crate::loader::{DEFAULT_PRELOAD_DEPTH, DEFAULT_SAFE_RANGE};

pub const HELP_KEYS: &str = "\
Commands (one per line on stdin):
  n / Enter     : Next image
  p             : Previous image
  f             : First image
  l             : Last image
  o <path>      : Open a file or directory
  r             : Reload current image
  i             : Show metadata of current image
  z <percent>   : Set zoom of current image
  m             : Cycle scale mode (fit, original, free)
  x             : Cancel loading of current image
  c             : Show cache contents
  q             : Quit
";

#[derive(Parser)]
#[command(name = "vale", about = "Step through the images of a directory", after_help = HELP_KEYS)]
pub struct Cli {
    /// Image file or directory to open
    pub path: Option<PathBuf>,

    /// Neighbors decoded ahead on each side of the current image
    #[arg(long, default_value_t = DEFAULT_PRELOAD_DEPTH)]
    pub preload_depth: usize,

    /// Neighbors kept in memory on each side (never below --preload-depth)
    #[arg(long, default_value_t = DEFAULT_SAFE_RANGE)]
    pub safe_range: usize,

    /// Directory for load time statistics and the log file
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Keep load time statistics in memory only
    #[arg(long)]
    pub no_persist: bool,

    /// Also write the log to log.txt in the data directory
    #[arg(long)]
    pub log_file: bool,

    /// Decode threads (default: available cores, 4-16)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["vale"]);
        assert!(cli.path.is_none());
        assert_eq!(cli.preload_depth, 2);
        assert_eq!(cli.safe_range, 4);
        assert!(!cli.no_persist);
    }

    #[test]
    fn path_and_ranges() {
        let cli = Cli::parse_from(["vale", "/photos/a.jpg", "--preload-depth", "3", "--safe-range", "6", "-j", "2"]);
        assert_eq!(cli.path.as_deref(), Some(std::path::Path::new("/photos/a.jpg")));
        assert_eq!(cli.preload_depth, 3);
        assert_eq!(cli.safe_range, 6);
        assert_eq!(cli.threads, Some(2));
    }
}
