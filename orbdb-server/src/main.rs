// SPDX-License-Identifier: AGPL-3.0-or-later
// OrbDB - Transactional Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! OrbDB Server Binary
//!
//! Hosts one storage over TCP.
//!
//! ```bash
//! # Serve ./data.orb on the default address
//! orbdb-server --path ./data.orb
//!
//! # Custom bind address, pid file, read-only
//! orbdb-server --path ./data.orb --bind 0.0.0.0:9011 --pid-file /run/orbdb.pid --read-only
//! ```
//!
//! Exit codes: 0 after SIGINT/SIGTERM, 1 after SIGHUP (restart requested),
//! 2 on option parse failure, >2 on internal error.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orbdb_server::{Server, ServerConfig};
use orbdb_storage::{ObjectStore, StoreOptions};

/// OrbDB storage server
#[derive(Parser, Debug)]
#[command(name = "orbdb-server")]
#[command(about = "OrbDB storage server - append-only object store over TCP")]
#[command(version)]
struct Args {
    /// Path to the log file (created if absent)
    #[arg(long)]
    path: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9011")]
    bind: SocketAddr,

    /// Storage name clients register against
    #[arg(long, default_value = "main")]
    storage: String,

    /// Open the storage read-only
    #[arg(long)]
    read_only: bool,

    /// Write the server pid to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// File holding the shared secret for message authentication
    #[arg(long)]
    secret_file: Option<PathBuf>,
}

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGHUP, handler);
    }
}

#[cfg(unix)]
const SIGHUP: i32 = libc::SIGHUP;

#[cfg(not(unix))]
fn install_signal_handlers() {}

#[cfg(not(unix))]
const SIGHUP: i32 = 1;

fn main() -> ExitCode {
    // Parse failures exit with status 2 via clap.
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "server failed");
            ExitCode::from(3)
        }
    }
}

fn run(args: Args) -> orbdb_core::Result<ExitCode> {
    let store = Arc::new(ObjectStore::open(
        &args.path,
        StoreOptions {
            name: args.storage.clone(),
            read_only: args.read_only,
            ..Default::default()
        },
    )?);

    let secret = match &args.secret_file {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    if let Some(pid_file) = &args.pid_file {
        let mut file = std::fs::File::create(pid_file)?;
        writeln!(file, "{}", std::process::id())?;
    }

    let mut server = Server::new(ServerConfig {
        bind: args.bind,
        secret,
        ..Default::default()
    });
    server.add_storage(&args.storage, Arc::clone(&store));
    let server = Arc::new(server);
    let shutdown = server.shutdown_flag();

    install_signal_handlers();
    // Watch for signals and raise the shutdown flag.
    let watcher = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || loop {
            let sig = LAST_SIGNAL.load(Ordering::SeqCst);
            if sig != 0 {
                shutdown.store(true, Ordering::Release);
                return sig;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        })
    };

    server.run()?;
    store.flush_index()?;

    if let Some(pid_file) = &args.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    let sig = watcher.join().unwrap_or(0);
    let code = if sig == SIGHUP {
        info!("restart requested (SIGHUP)");
        ExitCode::from(1)
    } else {
        info!("clean shutdown");
        ExitCode::SUCCESS
    };
    Ok(code)
}
