// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lodestone command line: run the daemon, talk to a running daemon, or
//! access lease storage directly.
//!
//! - `daemon` acquires leases for the local host, associates them with
//!   local pids, and reclaims them when those pids exit.
//! - `client <action>` asks a running daemon to do the work.
//! - `direct <action>` reads and writes storage with no daemon involved.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tokio::net::UnixStream;

use lodestone::config::DaemonConfig;
use lodestone::daemon::Daemon;
use lodestone::diskio::SyncDisk;
use lodestone::ondisk::{
    DELTA_DISK_MAGIC, DELTA_RECORD_SIZE, DISK_VERSION, DeltaRecord, LEADER_RECORD_SIZE,
    LeaderRecord, PAXOS_DISK_CLEAR, PAXOS_DISK_MAGIC, REQ_DISK_MAGIC, REQUEST_RECORD_SIZE,
    RequestRecord,
};
use lodestone::protocol::{
    self, AcquireRequest, Cmd, DiskSpec, Header, InquireReply, LockspaceSpec, LogDumpReply,
    REL_ALL, ReleaseRequest, ResourceSpec, StatusReply,
};
use lodestone::timeouts::Timeouts;
use lodestone::token::Token;
use lodestone::{DEFAULT_MAX_HOSTS, delta, paxos};

#[derive(Parser)]
#[command(name = "lodestone", version, about = "shared-storage lease manager")]
struct Cli {
    /// Debug: stay in the foreground and log everything to stderr.
    #[arg(short = 'D', global = true)]
    debug: bool,

    /// Runtime directory holding the control socket.
    #[arg(long, global = true, default_value = "/var/run/lodestone")]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lease manager daemon.
    Daemon {
        /// TOML config file; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use the watchdog multiplexer (1 yes, 0 no).
        #[arg(short = 'w')]
        use_watchdog: Option<u8>,
        /// Default io_timeout in seconds.
        #[arg(short = 'o')]
        io_timeout: Option<u32>,
    },
    /// Send a request to the running daemon.
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
    /// Access lease storage directly, without the daemon.
    Direct {
        /// Open disks without O_DIRECT (for regular files).
        #[arg(long)]
        no_direct: bool,
        /// io_timeout in seconds.
        #[arg(short = 'o', default_value_t = lodestone::timeouts::DEFAULT_IO_TIMEOUT_SECONDS)]
        io_timeout: u32,
        #[command(subcommand)]
        action: DirectAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Print daemon, lockspace, client and lease state.
    Status {
        /// Print the reply as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the daemon's recent event journal.
    LogDump,
    /// Kill pids, release leases and exit.
    Shutdown,
    /// Join a lockspace: LOCKSPACE is name:host_id:path:offset.
    AddLockspace {
        #[arg(short = 's')]
        lockspace: String,
        #[arg(short = 'o')]
        io_timeout: Option<u32>,
    },
    /// Leave a lockspace, releasing our host_id in it.
    RemLockspace {
        #[arg(short = 's')]
        lockspace: String,
    },
    /// Acquire leases for a registered pid: RESOURCE is
    /// space:resource:path:offset[:lver].
    Acquire {
        #[arg(short = 'p')]
        pid: u32,
        #[arg(short = 'r', required = true)]
        resources: Vec<String>,
        /// Change num_hosts in the leases when acquired.
        #[arg(short = 'n')]
        num_hosts: Option<u64>,
    },
    /// Release leases for a registered pid.
    Release {
        #[arg(short = 'p')]
        pid: u32,
        #[arg(short = 'r')]
        resources: Vec<String>,
        /// Release everything the pid holds.
        #[arg(long)]
        all: bool,
    },
    /// Display the leases held by a registered pid.
    Inquire {
        #[arg(short = 'p')]
        pid: u32,
        /// Print the reply as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DirectAction {
    /// Format lease areas: -s for a lockspace, -r for a resource.
    Init {
        #[arg(short = 's')]
        lockspace: Option<String>,
        #[arg(short = 'r')]
        resource: Option<String>,
        /// host_ids 1..=num_hosts can acquire the resource lease.
        #[arg(short = 'n')]
        num_hosts: Option<u64>,
        /// Disk space is allocated for this many hosts.
        #[arg(short = 'm', default_value_t = DEFAULT_MAX_HOSTS)]
        max_hosts: u64,
        /// Write the CLEAR magic, reserving the area without enabling it.
        #[arg(long)]
        clear: bool,
    },
    /// Print the records of an initialized lease area: path[:offset].
    Dump { target: String },
    /// Read, or write with -f, the request record of a resource lease:
    /// RESOURCE is space:resource:path:offset[:lver].
    Request {
        #[arg(short = 'r')]
        resource: String,
        /// force_mode to store; without it the record is only read.
        #[arg(short = 'f')]
        force_mode: Option<u32>,
    },
    /// Acquire a host_id delta lease directly.
    AcquireId {
        #[arg(short = 's')]
        lockspace: String,
    },
    /// Release a host_id delta lease directly.
    ReleaseId {
        #[arg(short = 's')]
        lockspace: String,
    },
    /// Renew a host_id delta lease directly.
    RenewId {
        #[arg(short = 's')]
        lockspace: String,
    },
}

/// LOCKSPACE argument: `name:host_id:path:offset`.
fn parse_lockspace(arg: &str) -> Result<LockspaceSpec> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 4 {
        bail!("lockspace must be name:host_id:path:offset, got {arg:?}");
    }
    Ok(LockspaceSpec {
        name: parts[0].to_owned(),
        host_id: parts[1].parse()?,
        path: parts[2].to_owned(),
        offset: parts[3].parse()?,
        io_timeout: 0,
    })
}

/// RESOURCE argument: `space:resource:path:offset[:lver]`.
fn parse_resource(arg: &str) -> Result<ResourceSpec> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 4 && parts.len() != 5 {
        bail!("resource must be space:resource:path:offset[:lver], got {arg:?}");
    }
    Ok(ResourceSpec {
        lockspace_name: parts[0].to_owned(),
        resource_name: parts[1].to_owned(),
        disks: vec![DiskSpec {
            path: parts[2].to_owned(),
            offset: parts[3].parse()?,
        }],
        lver: if parts.len() == 5 { parts[4].parse()? } else { 0 },
        num_hosts: 0,
        shared: false,
    })
}

fn setup_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    logforth::builder()
        .dispatch(|d| {
            d.filter(level)
                .append(logforth::append::Stderr::default())
        })
        .apply();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    setup_logging(cli.debug);

    match cli.command {
        Command::Daemon {
            config,
            use_watchdog,
            io_timeout,
        } => {
            let mut config = DaemonConfig::load(config.as_deref()).map_err(|err| eyre!(err))?;
            config.run_dir = cli.run_dir.clone();
            if let Some(wd) = use_watchdog {
                config.use_watchdog = wd != 0;
            }
            if let Some(io) = io_timeout {
                config.io_timeout = io;
            }
            let daemon = Daemon::new(config);
            daemon.run().await.map_err(|err| eyre!("daemon: {err}"))?;
            Ok(())
        }
        Command::Client { action } => do_client(&cli.run_dir, action).await,
        Command::Direct {
            no_direct,
            io_timeout,
            action,
        } => do_direct(!no_direct, io_timeout, action).await,
    }
}

async fn call(
    run_dir: &std::path::Path,
    cmd: Cmd,
    cmd_flags: u32,
    body: &[u8],
    data: u32,
    data2: u32,
) -> Result<(Header, Vec<u8>)> {
    let socket = run_dir.join("lodestone.sock");
    let mut stream = UnixStream::connect(&socket)
        .await
        .map_err(|err| eyre!("connect {}: {err}", socket.display()))?;
    let header = Header::request(cmd, cmd_flags, body.len(), data, data2);
    protocol::write_message(&mut stream, &header, body)
        .await
        .map_err(|err| eyre!("send: {err}"))?;
    let reply = protocol::read_message(&mut stream)
        .await
        .map_err(|err| eyre!("recv: {err}"))?
        .ok_or_else(|| eyre!("daemon closed the connection"))?;
    Ok(reply)
}

fn check_result(reply: &Header) -> Result<()> {
    if reply.data != 0 {
        bail!("daemon returned error {}", reply.data);
    }
    Ok(())
}

async fn do_client(run_dir: &std::path::Path, action: ClientAction) -> Result<()> {
    match action {
        ClientAction::Status { json } => {
            let (reply, body) = call(run_dir, Cmd::Status, 0, &[], 0, 0).await?;
            check_result(&reply)?;
            let status: StatusReply = protocol::decode_body(&body)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!(
                "daemon io_timeout={} renewal={} renewal_fail={} host_id_timeout={}",
                status.daemon.io_timeout,
                status.daemon.renewal,
                status.daemon.renewal_fail,
                status.daemon.host_id_timeout
            );
            for sp in &status.spaces {
                println!(
                    "s {} host_id={} generation={} renewal_age={} killing_pids={}",
                    sp.name, sp.host_id, sp.host_generation, sp.renewal_age, sp.killing_pids
                );
            }
            for cl in &status.clients {
                println!(
                    "p {} {} cmd_active={} killing={}",
                    cl.pid, cl.owner_name, cl.cmd_active, cl.killing
                );
                for t in &cl.tokens {
                    println!(
                        "  r {}:{} token_id={} lver={} shared={}",
                        t.lockspace_name, t.resource_name, t.token_id, t.lver, t.shared
                    );
                }
            }
            Ok(())
        }
        ClientAction::LogDump => {
            let (reply, body) = call(run_dir, Cmd::LogDump, 0, &[], 0, 0).await?;
            check_result(&reply)?;
            let dump: LogDumpReply = protocol::decode_body(&body)?;
            for line in dump.lines {
                println!("{line}");
            }
            Ok(())
        }
        ClientAction::Shutdown => {
            let (reply, _) = call(run_dir, Cmd::Shutdown, 0, &[], 0, 0).await?;
            check_result(&reply)
        }
        ClientAction::AddLockspace {
            lockspace,
            io_timeout,
        } => {
            let mut spec = parse_lockspace(&lockspace)?;
            spec.io_timeout = io_timeout.unwrap_or(0);
            let body = protocol::encode_body(&spec)?;
            let (reply, _) = call(run_dir, Cmd::AddLockspace, 0, &body, 0, 0).await?;
            check_result(&reply)
        }
        ClientAction::RemLockspace { lockspace } => {
            let spec = parse_lockspace(&lockspace)?;
            let body = protocol::encode_body(&spec)?;
            let (reply, _) = call(run_dir, Cmd::RemLockspace, 0, &body, 0, 0).await?;
            check_result(&reply)
        }
        ClientAction::Acquire {
            pid,
            resources,
            num_hosts,
        } => {
            let mut specs = Vec::new();
            for arg in &resources {
                let mut spec = parse_resource(arg)?;
                if let Some(n) = num_hosts {
                    spec.num_hosts = n;
                }
                specs.push(spec);
            }
            let req = AcquireRequest {
                owner_name: format!("pid{pid}"),
                resources: specs,
            };
            let count = req.resources.len() as u32;
            let body = protocol::encode_body(&req)?;
            let (reply, _) = call(run_dir, Cmd::Acquire, 0, &body, count, pid).await?;
            check_result(&reply)
        }
        ClientAction::Release {
            pid,
            resources,
            all,
        } => {
            let (flags, body) = if all {
                (REL_ALL, Vec::new())
            } else {
                let mut specs = Vec::new();
                for arg in &resources {
                    specs.push(parse_resource(arg)?);
                }
                (0, protocol::encode_body(&ReleaseRequest { resources: specs })?)
            };
            let (reply, _) = call(run_dir, Cmd::Release, flags, &body, 0, pid).await?;
            check_result(&reply)
        }
        ClientAction::Inquire { pid, json } => {
            let (reply, body) = call(run_dir, Cmd::Inquire, 0, &[], 0, pid).await?;
            check_result(&reply)?;
            let inq: InquireReply = protocol::decode_body(&body)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&inq)?);
            } else {
                println!("{}", inq.state);
            }
            Ok(())
        }
    }
}

async fn do_direct(direct_io: bool, io_timeout: u32, action: DirectAction) -> Result<()> {
    let timeouts = Timeouts::from_io_timeout(io_timeout);
    match action {
        DirectAction::Init {
            lockspace,
            resource,
            num_hosts,
            max_hosts,
            clear,
        } => {
            if lockspace.is_none() && resource.is_none() {
                bail!("init needs -s LOCKSPACE and/or -r RESOURCE");
            }
            if let Some(arg) = lockspace {
                let spec = parse_lockspace(&arg)?;
                let mut disk = SyncDisk::new(&spec.path, spec.offset);
                disk.open(direct_io).map_err(|err| eyre!("{err}"))?;
                delta::lease_init(
                    &disk,
                    512,
                    timeouts.io_timeout_duration(),
                    &spec.name,
                    max_hosts,
                )
                .await
                .map_err(|err| eyre!("init lockspace: {err}"))?;
            }
            if let Some(arg) = resource {
                let spec = parse_resource(&arg)?;
                let mut token = direct_token(&spec, 1, 1, timeouts.io_timeout, max_hosts);
                token.open_disks(direct_io).map_err(|err| eyre!("{err}"))?;
                paxos::init(&mut token, num_hosts.unwrap_or(0), clear)
                    .await
                    .map_err(|err| eyre!("init resource: {err}"))?;
            }
            Ok(())
        }
        DirectAction::Dump { target } => dump_area(direct_io, timeouts, &target).await,
        DirectAction::Request {
            resource,
            force_mode,
        } => {
            let spec = parse_resource(&resource)?;
            let mut token = direct_token(&spec, 1, 1, timeouts.io_timeout, DEFAULT_MAX_HOSTS);
            token.open_disks(direct_io).map_err(|err| eyre!("{err}"))?;
            // pick up the real sector size from the leader before touching
            // sector 1
            paxos::read_resource(&mut token)
                .await
                .map_err(|err| eyre!("request read_resource: {err}"))?;

            if let Some(mode) = force_mode {
                let mut rr = paxos::request_read(&token)
                    .await
                    .map_err(|err| eyre!("request read: {err}"))?;
                rr.magic = REQ_DISK_MAGIC;
                rr.version = DISK_VERSION;
                if spec.lver != 0 {
                    rr.lver = spec.lver;
                }
                rr.force_mode = mode;
                paxos::request_write(&token, &mut rr)
                    .await
                    .map_err(|err| eyre!("request write: {err}"))?;
            }

            let rr = paxos::request_read(&token)
                .await
                .map_err(|err| eyre!("request read: {err}"))?;
            println!(
                "request magic {:x} lver {} force_mode {}",
                rr.magic, rr.lver, rr.force_mode
            );
            Ok(())
        }
        DirectAction::AcquireId { lockspace } => {
            let (spec, disk) = open_lockspace(direct_io, &lockspace)?;
            let rec =
                delta::lease_acquire(&disk, 512, &timeouts, &spec.name, spec.host_id)
                    .await
                    .map_err(|err| eyre!("acquire_id: {err}"))?;
            println!(
                "acquired host_id {} generation {}",
                rec.owner_id, rec.owner_generation
            );
            Ok(())
        }
        DirectAction::ReleaseId { lockspace } => {
            let (spec, disk) = open_lockspace(direct_io, &lockspace)?;
            let cur = delta::lease_read(
                &disk,
                512,
                timeouts.io_timeout_duration(),
                &spec.name,
                spec.host_id,
            )
            .await
            .map_err(|err| eyre!("release_id read: {err}"))?;
            delta::lease_release(&disk, 512, &timeouts, &spec.name, &cur)
                .await
                .map_err(|err| eyre!("release_id: {err}"))?;
            Ok(())
        }
        DirectAction::RenewId { lockspace } => {
            let (spec, disk) = open_lockspace(direct_io, &lockspace)?;
            let cur = delta::lease_read(
                &disk,
                512,
                timeouts.io_timeout_duration(),
                &spec.name,
                spec.host_id,
            )
            .await
            .map_err(|err| eyre!("renew_id read: {err}"))?;
            let rec = delta::lease_renew(&disk, 512, &timeouts, &spec.name, &cur, true)
                .await
                .map_err(|err| eyre!("renew_id: {err}"))?;
            println!("renewed host_id {} timestamp {}", rec.owner_id, rec.timestamp);
            Ok(())
        }
    }
}

fn direct_token(
    spec: &ResourceSpec,
    host_id: u64,
    host_generation: u64,
    io_timeout: u32,
    max_hosts: u64,
) -> Token {
    Token {
        token_id: 0,
        space_name: spec.lockspace_name.clone(),
        resource_name: spec.resource_name.clone(),
        disks: spec
            .disks
            .iter()
            .map(|d| SyncDisk::new(&d.path, d.offset))
            .collect(),
        host_id,
        host_generation,
        max_hosts,
        io_timeout,
        ..Default::default()
    }
}

fn open_lockspace(direct_io: bool, arg: &str) -> Result<(LockspaceSpec, SyncDisk)> {
    let spec = parse_lockspace(arg)?;
    let mut disk = SyncDisk::new(&spec.path, spec.offset);
    disk.open(direct_io).map_err(|err| eyre!("{err}"))?;
    Ok((spec, disk))
}

/// Prints whatever records live at `path[:offset]`.
async fn dump_area(direct_io: bool, timeouts: Timeouts, target: &str) -> Result<()> {
    let (path, offset) = match target.rsplit_once(':') {
        Some((path, offset)) if offset.chars().all(|c| c.is_ascii_digit()) => {
            (path.to_owned(), offset.parse()?)
        }
        _ => (target.to_owned(), 0),
    };
    let mut disk = SyncDisk::new(&path, offset);
    disk.open(direct_io).map_err(|err| eyre!("{err}"))?;

    let buf = lodestone::diskio::read_sectors(&disk, 512, 0, 8, timeouts.io_timeout_duration())
        .await
        .map_err(|err| eyre!("read: {err}"))?;
    let first = &buf.as_slice()[..LEADER_RECORD_SIZE];
    let (leader, _) = LeaderRecord::decode(first);

    match leader.magic {
        PAXOS_DISK_MAGIC | PAXOS_DISK_CLEAR => {
            println!(
                "paxos leader magic {:x} space {} resource {} owner {} {} lver {} timestamp {}",
                leader.magic,
                leader.space_name,
                leader.resource_name,
                leader.owner_id,
                leader.owner_generation,
                leader.lver,
                leader.timestamp
            );
            // the request record sits one sector in
            let start = leader.sector_size as usize;
            if start != 0 && start + REQUEST_RECORD_SIZE <= buf.len() {
                let (rr, _) =
                    RequestRecord::decode(&buf.as_slice()[start..start + REQUEST_RECORD_SIZE]);
                if rr.magic == REQ_DISK_MAGIC {
                    println!(
                        "request lver {} force_mode {}",
                        rr.lver, rr.force_mode
                    );
                }
            }
        }
        DELTA_DISK_MAGIC => {
            for slot in 0..8u64 {
                let start = (slot * 512) as usize;
                let (rec, computed) =
                    DeltaRecord::decode(&buf.as_slice()[start..start + DELTA_RECORD_SIZE]);
                if rec.magic != DELTA_DISK_MAGIC || rec.checksum != computed {
                    continue;
                }
                println!(
                    "delta slot {} space {} owner {} {} timestamp {}",
                    slot + 1,
                    rec.space_name,
                    rec.owner_id,
                    rec.owner_generation,
                    rec.timestamp
                );
            }
        }
        other => bail!("unrecognized magic {other:x} at {path}:{offset}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockspace_arg_parsing() {
        let spec = parse_lockspace("vg0:3:/dev/vg0/leases:1048576").unwrap();
        assert_eq!(spec.name, "vg0");
        assert_eq!(spec.host_id, 3);
        assert_eq!(spec.path, "/dev/vg0/leases");
        assert_eq!(spec.offset, 1_048_576);
        assert!(parse_lockspace("vg0:3:/dev/vg0/leases").is_err());
        assert!(parse_lockspace("vg0:x:/p:0").is_err());
    }

    #[test]
    fn resource_arg_parsing() {
        let spec = parse_resource("vg0:disk1:/dev/vg0/leases:2097152").unwrap();
        assert_eq!(spec.lockspace_name, "vg0");
        assert_eq!(spec.resource_name, "disk1");
        assert_eq!(spec.lver, 0);

        let spec = parse_resource("vg0:disk1:/dev/vg0/leases:2097152:7").unwrap();
        assert_eq!(spec.lver, 7);
        assert!(parse_resource("vg0:disk1").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        Cli::try_parse_from(["lodestone", "daemon", "-o", "5"]).unwrap();
        Cli::try_parse_from(["lodestone", "client", "status", "--json"]).unwrap();
        Cli::try_parse_from(["lodestone", "client", "inquire", "-p", "100", "--json"]).unwrap();
        Cli::try_parse_from([
            "lodestone",
            "client",
            "acquire",
            "-p",
            "100",
            "-r",
            "vg0:disk1:/p:0",
        ])
        .unwrap();
        Cli::try_parse_from([
            "lodestone",
            "direct",
            "init",
            "-s",
            "vg0:1:/p:0",
            "-n",
            "8",
        ])
        .unwrap();
        Cli::try_parse_from([
            "lodestone",
            "direct",
            "request",
            "-r",
            "vg0:disk1:/p:0:7",
            "-f",
            "1",
        ])
        .unwrap();
    }
}
