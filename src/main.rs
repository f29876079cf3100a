//! cloakfs - encrypted overlay filesystem volume tool
//!
//! Usage:
//!   cloakfs init <cipherdir>    - Initialize a new encrypted volume
//!   cloakfs passwd <cipherdir>  - Change the volume password
//!   cloakfs info <cipherdir>    - Show volume parameters
//!
//! Mounting is done by the kernel-facing adapter, which links against the
//! cloakfs library; this binary only manages volumes.

use clap::{Parser, Subcommand};
use cloakfs::config::{conf_path, CryptConf};
use cloakfs::error::Error;
use cloakfs::exitcodes;
use cloakfs::fs::compat;
use cloakfs::names::create_diriv_at;
use cloakfs::readpass;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cloakfs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted overlay filesystem volume tool")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new encrypted volume in an empty directory
    Init {
        /// Backing directory that will hold the ciphertext
        cipher_dir: PathBuf,

        /// Use deterministic AES-SIV content encryption (reverse mode)
        #[arg(long)]
        aessiv: bool,

        /// Read the password from the first line of this file
        #[arg(long)]
        passfile: Option<PathBuf>,
    },

    /// Change the volume password
    Passwd {
        cipher_dir: PathBuf,

        /// Read the current password from the first line of this file
        #[arg(long)]
        passfile: Option<PathBuf>,
    },

    /// Show volume parameters
    Info { cipher_dir: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    // Claim descriptors 0-2 before anything else can be opened, so no
    // regular file ever ends up on a standard stream.
    if let Err(e) = compat::ensure_fds_012() {
        error!("could not reserve standard descriptors: {}", e);
        process::exit(exitcodes::INIT);
    }

    let code = match cli.command {
        Commands::Init {
            cipher_dir,
            aessiv,
            passfile,
        } => cmd_init(&cipher_dir, aessiv, passfile.as_deref()),
        Commands::Passwd {
            cipher_dir,
            passfile,
        } => cmd_passwd(&cipher_dir, passfile.as_deref()),
        Commands::Info { cipher_dir } => cmd_info(&cipher_dir),
    };
    process::exit(code);
}

fn cmd_init(cipher_dir: &Path, aessiv: bool, passfile: Option<&Path>) -> i32 {
    if let Err(msg) = check_empty_dir(cipher_dir) {
        error!("{}", msg);
        return exitcodes::CIPHER_DIR;
    }

    let password = match readpass::twice(passfile) {
        Ok(pw) => pw,
        Err(e) => {
            error!("{}", e);
            return password_exit_code(&e);
        }
    };

    let (conf, _master) = match CryptConf::create(&password, aessiv) {
        Ok(v) => v,
        Err(e) => {
            error!("creating config failed: {}", e);
            return exitcodes::INIT;
        }
    };
    if let Err(e) = conf.save(&conf_path(cipher_dir)) {
        error!("writing config failed: {}", e);
        return exitcodes::WRITE_CONF;
    }

    // The root directory needs its IV before any name can be encrypted.
    if let Err(e) = write_root_diriv(cipher_dir) {
        error!("writing root diriv failed: {}", e);
        return exitcodes::INIT;
    }

    info!("filesystem initialized in {}", cipher_dir.display());
    0
}

fn cmd_passwd(cipher_dir: &Path, passfile: Option<&Path>) -> i32 {
    let path = conf_path(cipher_dir);
    let mut conf = match CryptConf::load(&path) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return exitcodes::LOAD_CONF;
        }
    };

    let old = match readpass::once(passfile, "Password") {
        Ok(pw) => pw,
        Err(e) => {
            error!("{}", e);
            return password_exit_code(&e);
        }
    };
    let new = match readpass::twice(None) {
        Ok(pw) => pw,
        Err(e) => {
            error!("{}", e);
            return password_exit_code(&e);
        }
    };

    if let Err(e) = conf.rewrap(&old, &new) {
        error!("{}", e);
        return match e {
            Error::PasswordEmpty => exitcodes::PASSWORD_EMPTY,
            _ => exitcodes::LOAD_CONF,
        };
    }
    if let Err(e) = conf.save(&path) {
        error!("writing config failed: {}", e);
        return exitcodes::WRITE_CONF;
    }

    info!("password changed");
    0
}

fn cmd_info(cipher_dir: &Path) -> i32 {
    let conf = match CryptConf::load(&conf_path(cipher_dir)) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return exitcodes::LOAD_CONF;
        }
    };
    println!("Creator:      {}", conf.creator);
    println!("Version:      {}", conf.version);
    println!("FeatureFlags: {}", conf.feature_flags.join(" "));
    println!(
        "Scrypt:       N={} r={} p={}",
        conf.scrypt_object.n, conf.scrypt_object.r, conf.scrypt_object.p
    );
    0
}

fn password_exit_code(e: &Error) -> i32 {
    match e {
        Error::PasswordEmpty => exitcodes::PASSWORD_EMPTY,
        _ => exitcodes::READ_PASSWORD,
    }
}

fn check_empty_dir(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path)
        .map_err(|e| format!("cannot access {}: {}", path.display(), e))?;
    if !meta.is_dir() {
        return Err(format!("{} is not a directory", path.display()));
    }
    let mut entries = std::fs::read_dir(path)
        .map_err(|e| format!("cannot list {}: {}", path.display(), e))?;
    if entries.next().is_some() {
        return Err(format!("{} is not empty", path.display()));
    }
    Ok(())
}

fn write_root_diriv(cipher_dir: &Path) -> cloakfs::Result<()> {
    let fd = open(
        cipher_dir,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let res = create_diriv_at(fd).map(|_| ());
    let _ = nix::unistd::close(fd);
    res
}
