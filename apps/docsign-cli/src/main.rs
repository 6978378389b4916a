//! Docsign command-line tool
//!
//! Certificate issuance, flattening, merging, signing and verification
//! on local files.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use docsign_core::EngineConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "docsign")]
#[command(version, about = "Sign, verify and package PDF documents")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a self-signed certificate into a password-protected key store
    IssueCert {
        /// Distinguished name, e.g. "CN=Jane Doe,O=Acme"
        #[arg(long)]
        dn: String,
        #[arg(long, env = "DOCSIGN_KEY_STORE_PASSWORD")]
        password: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Show what a key store holds
    InspectKeystore {
        #[arg(long, env = "DOCSIGN_KEY_STORE_PASSWORD")]
        password: String,
        keystore: PathBuf,
    },
    /// Bake signature appearances into page content and drop the fields
    Flatten {
        /// Only flatten signed fields; unsigned placeholders stay
        #[arg(long)]
        only_signed: bool,
        input: PathBuf,
        output: PathBuf,
    },
    /// Concatenate PDFs in order
    Merge {
        output: PathBuf,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Sign one field with a local key store
    Sign {
        #[arg(long)]
        keystore: PathBuf,
        #[arg(long, env = "DOCSIGN_KEY_STORE_PASSWORD")]
        password: String,
        /// Signature field to fill (created when missing)
        #[arg(long)]
        field: String,
        /// 1-indexed page of a newly created field
        #[arg(long, default_value = "1")]
        page: u32,
        /// Page-relative "x,y,width,height" from the top-left corner
        #[arg(long, default_value = "0.1,0.8,0.35,0.08")]
        rect: String,
        #[arg(long, default_value = "Approval")]
        reason: String,
        input: PathBuf,
        output: PathBuf,
    },
    /// Check every embedded signature
    Verify { pdf: PathBuf },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("docsign_core=info".parse()?)
                .add_directive("docsign=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env();
    tracing::debug!("Running {:?}", args.command);

    match args.command {
        Command::IssueCert { dn, password, out } => {
            commands::issue_cert(&config, &dn, &password, &out)
        }
        Command::InspectKeystore { password, keystore } => {
            let summary = commands::inspect_keystore(&keystore, &password)?;
            println!("{}", summary);
            Ok(())
        }
        Command::Flatten {
            only_signed,
            input,
            output,
        } => commands::flatten(&input, &output, only_signed),
        Command::Merge { output, inputs } => commands::merge(&inputs, &output),
        Command::Sign {
            keystore,
            password,
            field,
            page,
            rect,
            reason,
            input,
            output,
        } => commands::sign(
            &config,
            &commands::SignArgs {
                keystore,
                password,
                field,
                page,
                rect,
                reason,
            },
            &input,
            &output,
        ),
        Command::Verify { pdf } => {
            let reports = commands::verify(&pdf)?;
            if reports.is_empty() {
                println!("No signatures found");
            }
            for report in &reports {
                println!("{}", report);
            }
            if reports.iter().any(|r| !r.valid) {
                anyhow::bail!("one or more signatures failed verification");
            }
            Ok(())
        }
    }
}
