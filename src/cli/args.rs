use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Fetches Git sources into a content-addressed store.
#[derive(Debug, Parser)]
#[command(version)]
pub struct CliArgs {
    #[command(subcommand)]
    pub cmd: Command,
    /// Location of the cache directory. Defaults to `$XDG_CACHE_HOME/srcfetch`.
    #[arg(short, long, env = "SRCFETCH_CACHE__DIR", global = true)]
    pub cache_directory: Option<PathBuf>,
    /// Location of the store. Defaults to `store` inside the cache directory.
    #[arg(short, long, env = "SRCFETCH_STORE__DIR", global = true)]
    pub store_directory: Option<PathBuf>,
    /// Seconds before a fetched branch is fetched again.
    #[arg(long, global = true)]
    pub ttl: Option<u64>,
    /// Mirror `file://` working trees like remote repositories.
    #[arg(long, global = true)]
    pub force_remote: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetches a Git repository into the store and prints the store path
    Fetch {
        /// `git+https://...`, `git+file://...` and similar URLs
        url: String,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        rev: Option<String>,
        #[arg(long)]
        shallow: bool,
        #[arg(long)]
        submodules: bool,
        #[arg(long)]
        all_refs: bool,
        /// Name of the store path
        #[arg(long)]
        name: Option<String>,
    },
    /// Clones a Git repository into a directory
    Clone {
        url: String,
        directory: PathBuf,
        #[arg(long = "ref")]
        reference: Option<String>,
    },
    /// Prints the hash of the canonical dump of a directory
    HashPath { path: PathBuf },
    /// Normalises a Git URL, optionally overriding its reference and revision
    ToUrl {
        url: String,
        #[arg(long = "ref")]
        reference: Option<String>,
        #[arg(long)]
        rev: Option<String>,
    },
    /// Removes cached fetch results and Git mirrors
    ClearCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn parses_fetch_flags() {
        let args = CliArgs::try_parse_from([
            "srcfetch",
            "fetch",
            "git+https://example.org/repo.git",
            "--ref",
            "main",
            "--shallow",
            "--ttl",
            "60",
        ])
        .unwrap();
        assert_eq!(args.ttl, Some(60));
        match args.cmd {
            Command::Fetch {
                url,
                reference,
                rev,
                shallow,
                submodules,
                ..
            } => {
                assert_eq!(url, "git+https://example.org/repo.git");
                assert_eq!(reference.as_deref(), Some("main"));
                assert_eq!(rev, None);
                assert!(shallow);
                assert!(!submodules);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verifies_cli_definition() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
