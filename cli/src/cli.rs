use {
    clap::{Parser, Subcommand},
    std::path::PathBuf,
    url::Url,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Cli {
    /// Path to the config file.
    #[clap(long)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload files.
    Put {
        /// Server base URL (overrides `base_url` from the config).
        #[clap(long)]
        server: Option<Url>,
        /// Compress the payload with deflate.
        #[clap(long, overrides_with = "no_compress")]
        compress: bool,
        #[clap(long, overrides_with = "compress")]
        no_compress: bool,
        /// Encrypt the payload with a password.
        #[clap(long, overrides_with = "no_encrypt")]
        encrypt: bool,
        #[clap(long, overrides_with = "encrypt")]
        no_encrypt: bool,
        /// Bundle all arguments into a single tar archive.
        #[clap(long)]
        archive: bool,
        /// Ask the server to expire the upload after this many days.
        #[clap(long)]
        max_days: Option<u32>,
        /// Ask the server to expire the upload after this many downloads.
        #[clap(long)]
        max_downloads: Option<u32>,
        /// Print the SHA-256 checksum of each uploaded container.
        #[clap(long)]
        checksum: bool,
        /// Files or directories to upload; a single `-` reads stdin.
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download and unpack previously uploaded files.
    Get {
        /// Directory to place the downloaded content into.
        #[clap(long, default_value = ".")]
        dest: PathBuf,
        /// Write the decoded stream to stdout instead of a file.
        #[clap(long)]
        stdout: bool,
        /// Print the SHA-256 checksum of each downloaded container.
        #[clap(long)]
        checksum: bool,
        #[clap(required = true)]
        urls: Vec<Url>,
    },
}

/// Resolves an on/off flag pair against a config default.
#[must_use]
pub fn flag_override(on: bool, off: bool, config_default: bool) -> bool {
    if on {
        true
    } else if off {
        false
    } else {
        config_default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn get_accepts_a_checksum_flag() {
        let cli = Cli::parse_from(["kasta", "get", "--checksum", "http://localhost/abc/x.bin"]);
        let Command::Get { checksum, urls, .. } = cli.command else {
            panic!("expected a get command");
        };
        assert!(checksum);
        assert_eq!(urls.len(), 1);
    }

    #[test]
    fn flag_pair_resolution() {
        assert!(flag_override(true, false, false));
        assert!(!flag_override(false, true, true));
        assert!(flag_override(false, false, true));
        assert!(!flag_override(false, false, false));
    }
}
