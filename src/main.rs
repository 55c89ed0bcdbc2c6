use std::time::Duration;

use clap::Parser;
use log::{error, info};

use srcfetch::{
    cli::{
        args::{CliArgs, Command},
        command_handlers::{do_hash_path, do_to_url},
    },
    model::{Input, Rev},
    store::HashAlgorithm,
    Srcfetch, SrcfetchBuilder,
};

fn builder(cli_args: &CliArgs) -> SrcfetchBuilder {
    let mut builder = Srcfetch::builder();
    if let Some(cache_directory) = &cli_args.cache_directory {
        builder = builder.cache_directory(cache_directory);
    }
    if let Some(store_directory) = &cli_args.store_directory {
        builder = builder.store_directory(store_directory);
    }
    if let Some(ttl) = cli_args.ttl {
        builder = builder.ttl(Duration::from_secs(ttl));
    }
    if cli_args.force_remote {
        builder = builder.force_remote(true);
    }
    builder
}

fn run() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();

    match &cli_args.cmd {
        Command::Fetch {
            url,
            reference,
            rev,
            shallow,
            submodules,
            all_refs,
            name,
        } => {
            let rev = rev.as_deref().map(str::parse::<Rev>).transpose()?;
            let mut input =
                Input::from_url(url)?.apply_overrides(reference.as_deref(), rev.as_ref())?;
            if *shallow {
                input = input.with_shallow(true);
            }
            if *submodules {
                input = input.with_submodules(true);
            }
            if *all_refs {
                input = input.with_all_refs(true);
            }
            if let Some(name) = name {
                input = input.with_name(name);
            }

            let srcfetch = builder(&cli_args).try_build()?;
            let fetched = srcfetch.fetch(&input)?;
            info!("Locked input: {}", fetched.input);
            info!("NAR hash: {}", fetched.nar_hash);
            println!("{}", fetched.path.display());
        }
        Command::Clone {
            url,
            directory,
            reference,
        } => {
            let input = Input::from_url(url)?.apply_overrides(reference.as_deref(), None)?;
            builder(&cli_args).try_build()?.clone(&input, directory)?;
        }
        Command::HashPath { path } => {
            println!("{}", do_hash_path(path, HashAlgorithm::Sha256)?);
        }
        Command::ToUrl {
            url,
            reference,
            rev,
        } => {
            println!("{}", do_to_url(url, reference.as_deref(), rev.as_deref())?);
        }
        Command::ClearCache => {
            builder(&cli_args).try_build()?.clear_cache()?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
