// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The orchestrator: client socket, command dispatch, and the
//! kill-on-failure state machine.
//!
//! Clients register over a local stream socket and are represented by a
//! client record owning up to [`MAX_RESOURCES`] tokens. Long commands run
//! in the connection's own task; at most one is in flight per client. A
//! 2-second tick walks all lockspaces: a space that stopped renewing (or
//! was asked to go away) enters `killing_pids`, its local holders get
//! SIGTERM then SIGKILL, and once they are gone the space is torn down.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::diskio::SyncDisk;
use crate::error::{Error, wire_code};
use crate::lockspace::{Space, SpaceRegistry};
use crate::ondisk;
use crate::protocol::{
    self, AcquireRequest, ClientStatus, Cmd, DaemonStatus, Header, InquireReply, LockspaceSpec,
    LogDumpReply, REL_ALL, ReleaseRequest, SELF_PID, SpaceStatus, StatusReply, TokenStatus,
};
use crate::timeouts::Timeouts;
use crate::token::{self, ResourceTracker, Token};
use crate::{DEFAULT_MAX_HOSTS, MAX_RESOURCES, monotime};

/// Period of the housekeeping tick.
const TICK: Duration = Duration::from_millis(2000);
/// Pause between a kill round and the next escalation check.
const KILL_PAUSE: Duration = Duration::from_millis(500);
/// Escalation count after which stuck pids are only logged.
const KILLING_DUMP: u32 = 10;
/// How many journal lines LOG_DUMP keeps.
const JOURNAL_LEN: usize = 1024;

/// One registered local process.
#[derive(Debug)]
struct ClientRecord {
    pid: i32,
    owner_name: String,
    cmd_active: u32,
    acquire_done: bool,
    pid_dead: bool,
    killing: u32,
    tokens: Vec<Option<Token>>,
}

impl ClientRecord {
    fn new(pid: i32) -> Self {
        Self {
            pid,
            owner_name: String::new(),
            cmd_active: 0,
            acquire_done: false,
            pid_dead: false,
            killing: 0,
            tokens: (0..MAX_RESOURCES).map(|_| None).collect(),
        }
    }

    fn empty_slots(&self) -> usize {
        self.tokens.iter().filter(|t| t.is_none()).count()
    }

    fn uses_space(&self, space_name: &str) -> bool {
        self.tokens
            .iter()
            .flatten()
            .any(|t| t.space_name == space_name)
    }
}

#[derive(Default)]
struct ClientTable {
    slots: Vec<Option<ClientRecord>>,
}

impl ClientTable {
    fn add(&mut self, record: ClientRecord) -> usize {
        for (ci, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(record);
                return ci;
            }
        }
        self.slots.push(Some(record));
        self.slots.len() - 1
    }

    fn get_mut(&mut self, ci: usize) -> Option<&mut ClientRecord> {
        self.slots.get_mut(ci).and_then(Option::as_mut)
    }

    fn find_pid(&self, pid: i32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|cl| cl.pid == pid))
    }
}

/// Ring of recent daemon events, served by LOG_DUMP.
#[derive(Default)]
struct Journal {
    lines: std::sync::Mutex<VecDeque<String>>,
}

impl Journal {
    fn note(&self, line: String) {
        info!("{line}");
        let mut lines = self.lines.lock().expect("journal poisoned");
        if lines.len() == JOURNAL_LEN {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn dump(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("journal poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// The daemon: all process-wide state, constructed at startup and torn
/// down on shutdown.
pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<SpaceRegistry>,
    tracker: Arc<ResourceTracker>,
    clients: Mutex<ClientTable>,
    journal: Journal,
    cancel: CancellationToken,
    external_shutdown: AtomicBool,
    token_id_counter: AtomicU64,
}

impl Daemon {
    #[must_use]
    pub fn new(config: DaemonConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SpaceRegistry::new()),
            tracker: Arc::new(ResourceTracker::new()),
            clients: Mutex::new(ClientTable::default()),
            journal: Journal::default(),
            cancel: CancellationToken::new(),
            external_shutdown: AtomicBool::new(false),
            token_id_counter: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SpaceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the control socket and serves until shutdown drains the last
    /// lockspace.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        std::fs::create_dir_all(&self.config.run_dir)?;
        let lockfile = self.config.lockfile_path();
        take_lockfile(&lockfile)?;

        let socket_path = self.config.socket_path();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|err| Error::Io(format!("bind {}: {err}", socket_path.display())))?;
        info!("daemon listening on {}", socket_path.display());

        let ticker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    () = ticker.cancel.cancelled() => break,
                    _ = interval.tick() => ticker.tick().await,
                }
            }
        });

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { continue };
                    tokio::spawn(self.clone().handle_connection(stream));
                }
            }
        }

        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&lockfile);
        info!("daemon exiting");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: UnixStream) {
        let mut registered_ci: Option<usize> = None;
        loop {
            let msg = tokio::select! {
                () = self.cancel.cancelled() => break,
                msg = protocol::read_message(&mut stream) => msg,
            };
            let (header, body) = match msg {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    debug!("connection read error: {err}");
                    break;
                }
            };
            if self
                .dispatch(&mut stream, &header, &body, &mut registered_ci)
                .await
                .is_err()
            {
                break;
            }
        }
        if let Some(ci) = registered_ci {
            self.client_pid_dead(ci).await;
        }
    }

    async fn dispatch(
        &self,
        stream: &mut UnixStream,
        header: &Header,
        body: &[u8],
        registered_ci: &mut Option<usize>,
    ) -> Result<(), Error> {
        let cmd = match Cmd::try_from(header.cmd) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("unknown command {}: {err}", header.cmd);
                return self.reply(stream, header, Err(err), 0, &[]).await;
            }
        };

        match cmd {
            Cmd::Register => {
                let pid = stream
                    .peer_cred()
                    .ok()
                    .and_then(|cred| cred.pid())
                    .unwrap_or(0);
                if pid <= 0 {
                    return self
                        .reply(stream, header, Err(Error::NotRegistered), 0, &[])
                        .await;
                }
                let ci = self.clients.lock().await.add(ClientRecord::new(pid));
                *registered_ci = Some(ci);
                debug!("cmd_register ci {ci} pid {pid}");
                self.reply(stream, header, Ok(()), 0, &[]).await
            }
            Cmd::Shutdown => {
                self.journal.note("external shutdown".into());
                self.external_shutdown.store(true, Ordering::SeqCst);
                self.reply(stream, header, Ok(()), 0, &[]).await
            }
            Cmd::Status => {
                let status = self.build_status().await;
                let body = protocol::encode_body(&status)?;
                self.reply(stream, header, Ok(()), 0, &body).await
            }
            Cmd::LogDump => {
                let dump = LogDumpReply {
                    lines: self.journal.dump(),
                };
                let body = protocol::encode_body(&dump)?;
                self.reply(stream, header, Ok(()), 0, &body).await
            }
            Cmd::AddLockspace => {
                let result = self.cmd_add_lockspace(body).await;
                self.reply(stream, header, result, 0, &[]).await
            }
            Cmd::RemLockspace => {
                let result = self.cmd_rem_lockspace(body).await;
                self.reply(stream, header, result, 0, &[]).await
            }
            Cmd::Acquire | Cmd::Release | Cmd::Inquire => {
                let ci = match self.resolve_target(header, *registered_ci).await {
                    Ok(ci) => ci,
                    Err(err) => return self.reply(stream, header, Err(err), 0, &[]).await,
                };
                if let Err(err) = self.set_cmd_active(ci, header.cmd).await {
                    return self.reply(stream, header, Err(err), 0, &[]).await;
                }
                match cmd {
                    Cmd::Acquire => {
                        let result = self.cmd_acquire(ci, body).await;
                        self.reply(stream, header, result, 0, &[]).await
                    }
                    Cmd::Release => {
                        let result = self.cmd_release(ci, header.cmd_flags, body).await;
                        self.clear_cmd_active(ci).await;
                        self.reply(stream, header, result, 0, &[]).await
                    }
                    Cmd::Inquire => {
                        let result = self.cmd_inquire(ci).await;
                        self.clear_cmd_active(ci).await;
                        match result {
                            Ok(reply) => {
                                let count = reply.count;
                                let body = protocol::encode_body(&reply)?;
                                self.reply(stream, header, Ok(()), count, &body).await
                            }
                            Err(err) => self.reply(stream, header, Err(err), 0, &[]).await,
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    async fn reply(
        &self,
        stream: &mut UnixStream,
        request: &Header,
        result: Result<(), Error>,
        data2: u32,
        body: &[u8],
    ) -> Result<(), Error> {
        if let Err(err) = &result {
            if !err.is_expected_outcome() {
                debug!("cmd {} error {err}", request.cmd);
            }
        }
        let header = request.reply(wire_code(&result), data2, body.len());
        protocol::write_message(stream, &header, body).await
    }

    /// Which client a resource command addresses: the caller's own
    /// registration, or another registered pid named in `data2`.
    async fn resolve_target(
        &self,
        header: &Header,
        registered_ci: Option<usize>,
    ) -> Result<usize, Error> {
        if header.data2 == SELF_PID {
            return registered_ci.ok_or(Error::NotRegistered);
        }
        let pid = header.data2 as i32;
        let clients = self.clients.lock().await;
        let ci = clients.find_pid(pid).ok_or(Error::NotFound)?;
        Ok(ci)
    }

    async fn set_cmd_active(&self, ci: usize, cmd: u32) -> Result<(), Error> {
        let mut clients = self.clients.lock().await;
        let cl = clients.get_mut(ci).ok_or(Error::NotRegistered)?;
        if cl.cmd_active != 0 {
            warn!("ci {ci} cmd {cmd} busy {}", cl.cmd_active);
            return Err(Error::Busy);
        }
        cl.cmd_active = cmd;
        Ok(())
    }

    async fn clear_cmd_active(&self, ci: usize) {
        let mut clients = self.clients.lock().await;
        if let Some(cl) = clients.get_mut(ci) {
            cl.cmd_active = 0;
        }
    }

    async fn cmd_add_lockspace(&self, body: &[u8]) -> Result<(), Error> {
        let spec: LockspaceSpec = protocol::decode_body(body)?;
        let io_timeout = if spec.io_timeout == 0 {
            self.config.io_timeout
        } else {
            spec.io_timeout
        };
        let timeouts = Timeouts::from_io_timeout(io_timeout);
        let disk = {
            let mut disk = SyncDisk::new(&spec.path, spec.offset);
            disk.open(self.config.direct_io)?;
            disk
        };
        // the sector size of the lockspace device; 512 unless told otherwise
        let sector_size = 512;
        self.journal.note(format!(
            "add_lockspace {} host_id {}",
            spec.name, spec.host_id
        ));
        self.registry
            .add_lockspace(
                &spec.name,
                spec.host_id,
                disk,
                sector_size,
                timeouts,
                self.config.status_slots,
                &self.config.watchdog_settings(),
            )
            .await
    }

    async fn cmd_rem_lockspace(&self, body: &[u8]) -> Result<(), Error> {
        let spec: LockspaceSpec = protocol::decode_body(body)?;
        self.journal.note(format!("rem_lockspace {}", spec.name));
        self.registry.rem_lockspace(&spec.name).await?;
        // the tick drains holders and tears the space down; the reply waits
        // until the name is actually gone
        loop {
            if !self.registry.space_exists(&spec.name).await {
                return Ok(());
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    async fn cmd_acquire(&self, ci: usize, body: &[u8]) -> Result<(), Error> {
        let req: AcquireRequest = match protocol::decode_body(body) {
            Ok(req) => req,
            Err(err) => return self.acquire_fail(ci, err).await,
        };
        if req.resources.len() > MAX_RESOURCES {
            return self.acquire_fail(ci, Error::TooBig).await;
        }

        let pid = {
            let mut clients = self.clients.lock().await;
            let cl = clients.get_mut(ci).ok_or(Error::NotRegistered)?;
            if cl.empty_slots() < req.resources.len() {
                drop(clients);
                return self.acquire_fail(ci, Error::NoSpace).await;
            }
            cl.owner_name = req.owner_name.clone();
            cl.pid
        };

        let result = self.acquire_tokens(ci, pid, &req).await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.acquire_fail(ci, err).await,
        }
    }

    async fn acquire_fail(&self, ci: usize, err: Error) -> Result<(), Error> {
        self.clear_cmd_active(ci).await;
        Err(err)
    }

    async fn acquire_tokens(&self, ci: usize, pid: i32, req: &AcquireRequest) -> Result<(), Error> {
        // build a token per resource, validating its lockspace up front
        let mut new_tokens = Vec::new();
        for spec in &req.resources {
            let info = self
                .registry
                .get_space_info(&spec.lockspace_name)
                .await
                .ok_or(Error::NotFound)?;
            if info.killing_pids {
                warn!("cmd_acquire bad space {}", spec.lockspace_name);
                return Err(Error::SpaceKilling);
            }
            let token_id = self.token_id_counter.fetch_add(1, Ordering::Relaxed);
            let token = Token {
                token_id,
                space_name: spec.lockspace_name.clone(),
                resource_name: spec.resource_name.clone(),
                disks: spec
                    .disks
                    .iter()
                    .map(|d| SyncDisk::new(&d.path, d.offset))
                    .collect(),
                host_id: info.host_id,
                host_generation: info.host_generation,
                sector_size: info.sector_size,
                align_size: ondisk::sector_size_to_align_size(info.sector_size),
                max_hosts: DEFAULT_MAX_HOSTS,
                io_timeout: info.timeouts.io_timeout,
                shared: spec.shared,
                pid,
                ..Default::default()
            };
            // permanent record of what the token_id stands for, since later
            // log lines reference only the id
            self.journal.note(format!(
                "lockspace {} resource {} has token_id {token_id} for pid {pid}",
                spec.lockspace_name, spec.resource_name
            ));
            new_tokens.push(token);
        }

        let mut added = 0;
        let mut opened = 0;
        let mut acquired = 0;
        let result = async {
            for token in &new_tokens {
                self.tracker.add_resource(token)?;
                added += 1;
            }
            for token in &mut new_tokens {
                token.open_disks(self.config.direct_io)?;
                opened += 1;
            }
            for (token, spec) in new_tokens.iter_mut().zip(&req.resources) {
                token::acquire_token(
                    token,
                    &self.registry,
                    0,
                    spec.lver,
                    spec.num_hosts,
                    &self.cancel,
                )
                .await?;
                acquired += 1;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            warn!("cmd_acquire pid {pid} error {err}");
            for token in new_tokens.iter_mut().take(acquired) {
                if let Err(err) = token::release_token(token).await {
                    warn!("cmd_acquire rollback release {err}");
                }
            }
            for token in new_tokens.iter_mut().take(opened) {
                token.close_disks();
            }
            for token in new_tokens.iter().take(added) {
                self.tracker.del_resource(token);
            }
            return Err(err);
        }

        // the lockspace may have failed while we were acquiring
        for token in &new_tokens {
            let still_ok = self
                .registry
                .get_space_info(&token.space_name)
                .await
                .is_some_and(|info| !info.killing_pids && info.host_id == token.host_id);
            if !still_ok {
                warn!("cmd_acquire bad space {}", token.space_name);
                self.rollback_tokens(new_tokens).await;
                return Err(Error::SpaceKilling);
            }
        }

        // transfer into the client record; pid death from here on is the
        // record's responsibility
        enum Install {
            Done,
            PidDead(Vec<Token>),
            NoSpace(Vec<Token>),
        }
        let install = {
            let mut clients = self.clients.lock().await;
            let Some(cl) = clients.get_mut(ci) else {
                return Err(Error::NotRegistered);
            };
            if cl.pid_dead {
                Install::PidDead(new_tokens)
            } else if cl.empty_slots() < new_tokens.len() {
                Install::NoSpace(new_tokens)
            } else {
                for token in new_tokens {
                    let slot = cl.tokens.iter_mut().find(|t| t.is_none());
                    *slot.expect("slot counted above") = Some(token);
                }
                cl.acquire_done = true;
                cl.cmd_active = 0;
                Install::Done
            }
        };

        match install {
            Install::Done => {
                debug!("cmd_acquire done pid {pid}");
                Ok(())
            }
            Install::PidDead(tokens) => {
                warn!("cmd_acquire pid {pid} dead");
                self.rollback_tokens(tokens).await;
                self.cleanup_dead_client(ci).await;
                Err(Error::NotFound)
            }
            Install::NoSpace(tokens) => {
                self.rollback_tokens(tokens).await;
                Err(Error::NoSpace)
            }
        }
    }

    async fn rollback_tokens(&self, tokens: Vec<Token>) {
        for mut token in tokens {
            if let Err(err) = token::release_token(&mut token).await {
                warn!("rollback release {}: {err}", token.resource_name);
            }
            token.close_disks();
            self.tracker.del_resource(&token);
        }
    }

    async fn cmd_release(&self, ci: usize, cmd_flags: u32, body: &[u8]) -> Result<(), Error> {
        let mut to_release = Vec::new();
        let mut result = Ok(());
        {
            let mut clients = self.clients.lock().await;
            let cl = clients.get_mut(ci).ok_or(Error::NotRegistered)?;
            if cmd_flags & REL_ALL != 0 {
                for slot in &mut cl.tokens {
                    if let Some(token) = slot.take() {
                        to_release.push(token);
                    }
                }
            } else {
                let req: ReleaseRequest = protocol::decode_body(body)?;
                for spec in &req.resources {
                    let found = cl.tokens.iter_mut().find(|slot| {
                        slot.as_ref().is_some_and(|t| {
                            t.space_name == spec.lockspace_name
                                && t.resource_name == spec.resource_name
                        })
                    });
                    match found {
                        Some(slot) => to_release.push(slot.take().expect("matched above")),
                        None => {
                            warn!(
                                "cmd_release no resource {}:{}",
                                spec.lockspace_name, spec.resource_name
                            );
                            result = Err(Error::NotFound);
                        }
                    }
                }
            }
        }

        for mut token in to_release {
            if let Err(err) = token::release_token(&mut token).await {
                warn!("cmd_release {} error {err}", token.resource_name);
                result = Err(err);
            }
            token.close_disks();
            self.tracker.del_resource(&token);
        }
        result
    }

    async fn cmd_inquire(&self, ci: usize) -> Result<InquireReply, Error> {
        let clients = self.clients.lock().await;
        let cl = clients
            .slots
            .get(ci)
            .and_then(Option::as_ref)
            .ok_or(Error::NotRegistered)?;

        let mut parts = Vec::new();
        for token in cl.tokens.iter().flatten() {
            let mut line = format!("{}:{}", token.space_name, token.resource_name);
            for disk in &token.disks {
                line.push_str(&format!(":{}:{}", disk.path.display(), disk.offset));
            }
            line.push_str(&format!(":{}", token.leader.lver));
            parts.push(line);
        }
        Ok(InquireReply {
            count: parts.len() as u32,
            state: parts.join(" "),
        })
    }

    /// The registered connection closed: the pid is gone (or abandoned its
    /// leases, which must be treated the same way).
    async fn client_pid_dead(&self, ci: usize) {
        let (pid, holding, delay) = {
            let mut clients = self.clients.lock().await;
            let Some(cl) = clients.get_mut(ci) else {
                return;
            };
            cl.pid_dead = true;
            let holding = cl.tokens.iter().flatten().count();
            // an acquire worker is still running; it will see pid_dead when
            // it installs and release everything it just acquired
            let delay = cl.cmd_active == Cmd::Acquire as u32 && !cl.acquire_done;
            (cl.pid, holding, delay)
        };
        debug!("client_pid_dead ci {ci} pid {pid}");
        if delay {
            debug!("client_pid_dead ci {ci} delay release");
            return;
        }
        if holding > 0 {
            // the pid must not outlive its leases
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        self.cleanup_dead_client(ci).await;
    }

    async fn cleanup_dead_client(&self, ci: usize) {
        let tokens = {
            let mut clients = self.clients.lock().await;
            let Some(slot) = clients.slots.get_mut(ci) else {
                return;
            };
            let Some(mut cl) = slot.take() else { return };
            cl.tokens.iter_mut().filter_map(Option::take).collect::<Vec<_>>()
        };
        for token in tokens {
            token::release_token_async(token, self.tracker.clone());
        }
    }

    /// Housekeeping pass, every 2 seconds.
    async fn tick(&self) {
        let shutdown = self.external_shutdown.load(Ordering::SeqCst);
        for space in self.registry.snapshot().await {
            let (killing, external_remove) = {
                let state = space.state.lock().await;
                (state.killing_pids, state.external_remove)
            };
            if killing != 0 {
                if self.all_pids_dead(&space).await {
                    self.journal
                        .note(format!("s{} all pids gone, removing", space.space_id));
                    self.registry.finish_removal(&space).await;
                } else {
                    self.kill_pids(&space).await;
                }
            } else if shutdown || external_remove || !space.host_id_renewed().await {
                self.journal
                    .note(format!("s{} set killing_pids", space.space_id));
                space.state.lock().await.killing_pids = 1;
                self.kill_pids(&space).await;
            }
        }
        if shutdown && self.registry.is_empty().await {
            self.cancel.cancel();
        }
    }

    async fn all_pids_dead(&self, space: &Arc<Space>) -> bool {
        let clients = self.clients.lock().await;
        for cl in clients.slots.iter().flatten() {
            if cl.pid != 0 && cl.uses_space(&space.space_name) {
                debug!(
                    "s{} used by pid {} killing {}",
                    space.space_id, cl.pid, cl.killing
                );
                return false;
            }
        }
        true
    }

    /// One escalation round against the holders of a failing space:
    /// SIGTERM first, SIGKILL from the second round, and after
    /// [`KILLING_DUMP`] rounds only a log line for whatever is stuck.
    async fn kill_pids(&self, space: &Arc<Space>) {
        let round = space.state.lock().await.killing_pids;
        if round > KILLING_DUMP + 1 {
            return;
        }
        if round > KILLING_DUMP {
            let clients = self.clients.lock().await;
            for cl in clients.slots.iter().flatten() {
                if cl.killing != 0 && cl.uses_space(&space.space_name) {
                    self.journal
                        .note(format!("kill_pids {} stuck", cl.pid));
                }
            }
            drop(clients);
            space.state.lock().await.killing_pids += 1;
            return;
        }

        let (signal, max_killing, name) = if round > 1 {
            (libc::SIGKILL, 2, "SIGKILL")
        } else {
            (libc::SIGTERM, 1, "SIGTERM")
        };

        let mut found = 0;
        {
            let mut clients = self.clients.lock().await;
            for cl in clients.slots.iter_mut().flatten() {
                if cl.pid <= 0 || cl.killing > max_killing {
                    continue;
                }
                if !cl.uses_space(&space.space_name) {
                    continue;
                }
                unsafe { libc::kill(cl.pid, signal) };
                cl.killing += 1;
                found += 1;
            }
        }
        if found > 0 {
            self.journal.note(format!(
                "s{} kill_pids {name} found {found} pids",
                space.space_id
            ));
            tokio::time::sleep(KILL_PAUSE).await;
        }
        space.state.lock().await.killing_pids += 1;
    }

    async fn build_status(&self) -> StatusReply {
        let timeouts = Timeouts::from_io_timeout(self.config.io_timeout);
        let daemon = DaemonStatus {
            io_timeout: timeouts.io_timeout,
            renewal: timeouts.renewal,
            renewal_fail: timeouts.renewal_fail,
            host_id_timeout: timeouts.host_id_timeout,
        };

        let mut spaces = Vec::new();
        for space in self.registry.snapshot().await {
            let state = space.state.lock().await;
            spaces.push(SpaceStatus {
                name: space.space_name.clone(),
                host_id: space.host_id,
                host_generation: state.host_generation,
                renewal_age: monotime().saturating_sub(state.last_success),
                killing_pids: state.killing_pids,
                external_remove: state.external_remove,
            });
        }

        let clients = self.clients.lock().await;
        let clients = clients
            .slots
            .iter()
            .flatten()
            .map(|cl| ClientStatus {
                pid: cl.pid,
                owner_name: cl.owner_name.clone(),
                cmd_active: cl.cmd_active,
                killing: cl.killing,
                tokens: cl
                    .tokens
                    .iter()
                    .flatten()
                    .map(|t| TokenStatus {
                        token_id: t.token_id,
                        lockspace_name: t.space_name.clone(),
                        resource_name: t.resource_name.clone(),
                        lver: t.leader.lver,
                        timestamp: t.leader.timestamp,
                        shared: t.shared,
                    })
                    .collect(),
            })
            .collect();

        StatusReply {
            daemon,
            spaces,
            clients,
        }
    }

    /// Test scaffolding: a registered client that never came over a socket.
    #[cfg(test)]
    pub(crate) async fn insert_client_for_test(&self, pid: i32, tokens: Vec<Token>) -> usize {
        let mut record = ClientRecord::new(pid);
        for (slot, token) in record.tokens.iter_mut().zip(tokens) {
            *slot = Some(token);
        }
        self.clients.lock().await.add(record)
    }
}

/// One daemon per run dir.
fn take_lockfile(path: &PathBuf) -> Result<(), Error> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            use std::io::Write;
            let _ = writeln!(file, "{}", std::process::id());
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::Io(format!(
            "lockfile {} exists, daemon already running?",
            path.display()
        ))),
        Err(err) => Err(Error::Io(format!("lockfile {}: {err}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskio::test_util::temp_disk;
    use crate::ondisk::{DELTA_DISK_MAGIC, DISK_VERSION, DeltaRecord};
    use crate::protocol::{DiskSpec, ResourceSpec};
    use crate::{LEASE_FREE, paxos};

    const FAST: Timeouts = Timeouts {
        io_timeout: 1,
        renewal: 1,
        renewal_warn: 2,
        renewal_fail: 3,
        host_id_timeout: 0,
    };

    fn test_config(tag: &str) -> DaemonConfig {
        let dir = std::env::temp_dir().join(format!(
            "lodestone-daemon-{tag}-{}",
            std::process::id()
        ));
        DaemonConfig {
            run_dir: dir.clone(),
            watchdog_dir: dir.join("watchdog"),
            use_watchdog: false,
            io_timeout: 1,
            direct_io: false,
            status_slots: 4,
        }
    }

    fn live_delta(host_id: u64) -> DeltaRecord {
        DeltaRecord {
            magic: DELTA_DISK_MAGIC,
            version: DISK_VERSION,
            io_timeout: 1,
            owner_id: host_id,
            owner_generation: 1,
            timestamp: crate::monotime(),
            space_name: "spc".into(),
            resource_name: "spc".into(),
            checksum: 0,
        }
    }

    async fn established_space(daemon: &Arc<Daemon>, tag: &str) -> SyncDisk {
        let ls_disk = temp_disk(tag, 8 * 512);
        crate::delta::lease_init(&ls_disk, 512, FAST.io_timeout_duration(), "spc", 8)
            .await
            .unwrap();
        daemon
            .registry()
            .insert_established("spc", 1, ls_disk.clone(), 512, FAST, live_delta(1))
            .await;
        ls_disk
    }

    async fn init_resource(tag: &str) -> SyncDisk {
        let disk = temp_disk(tag, 1024 * 1024);
        let mut token = Token {
            space_name: "spc".into(),
            resource_name: "res".into(),
            disks: vec![disk.clone()],
            host_id: 1,
            host_generation: 1,
            sector_size: 512,
            align_size: 1024 * 1024,
            max_hosts: 2000,
            io_timeout: 1,
            ..Default::default()
        };
        paxos::init(&mut token, 4, false).await.unwrap();
        disk
    }

    fn resource_spec(disk: &SyncDisk) -> ResourceSpec {
        ResourceSpec {
            lockspace_name: "spc".into(),
            resource_name: "res".into(),
            disks: vec![DiskSpec {
                path: disk.path.display().to_string(),
                offset: 0,
            }],
            lver: 0,
            num_hosts: 0,
            shared: false,
        }
    }

    async fn connect(path: &std::path::Path) -> UnixStream {
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("daemon socket never appeared at {}", path.display());
    }

    async fn roundtrip(
        stream: &mut UnixStream,
        cmd: Cmd,
        cmd_flags: u32,
        body: &[u8],
        data: u32,
        data2: u32,
    ) -> (Header, Vec<u8>) {
        let header = Header::request(cmd, cmd_flags, body.len(), data, data2);
        protocol::write_message(stream, &header, body).await.unwrap();
        protocol::read_message(stream)
            .await
            .unwrap()
            .expect("reply expected")
    }

    #[tokio::test]
    async fn socket_lifecycle() {
        let daemon = Daemon::new(test_config("e2e"));
        let ls_disk = established_space(&daemon, "e2e-ls").await;
        let res_disk = init_resource("e2e-res").await;

        let socket_path = daemon.config.socket_path();
        let run = tokio::spawn(daemon.clone().run());
        let mut stream = connect(&socket_path).await;

        // register
        let (reply, _) = roundtrip(&mut stream, Cmd::Register, 0, &[], 0, 0).await;
        assert_eq!(reply.data, 0);

        // acquire one resource for ourselves
        let req = AcquireRequest {
            owner_name: "test".into(),
            resources: vec![resource_spec(&res_disk)],
        };
        let body = protocol::encode_body(&req).unwrap();
        let (reply, _) = roundtrip(&mut stream, Cmd::Acquire, 0, &body, 1, SELF_PID).await;
        assert_eq!(reply.data, 0, "acquire failed");

        // a second acquire of the same resource is rejected locally
        let (reply, _) = roundtrip(&mut stream, Cmd::Acquire, 0, &body, 1, SELF_PID).await;
        assert_eq!(reply.data, wire_code(&Err(Error::Exists)));

        // inquire names the held lease
        let (reply, body) = roundtrip(&mut stream, Cmd::Inquire, 0, &[], 0, SELF_PID).await;
        assert_eq!(reply.data, 0);
        let inq: InquireReply = protocol::decode_body(&body).unwrap();
        assert_eq!(inq.count, 1);
        assert!(inq.state.starts_with("spc:res:"));
        assert!(inq.state.ends_with(":1"), "lver 1 expected: {}", inq.state);

        // status shows the space and the client
        let (reply, body) = roundtrip(&mut stream, Cmd::Status, 0, &[], 0, 0).await;
        assert_eq!(reply.data, 0);
        let status: StatusReply = protocol::decode_body(&body).unwrap();
        assert_eq!(status.spaces.len(), 1);
        assert_eq!(status.spaces[0].host_id, 1);
        assert_eq!(status.clients.len(), 1);
        assert_eq!(status.clients[0].tokens.len(), 1);

        // release everything
        let (reply, _) = roundtrip(&mut stream, Cmd::Release, REL_ALL, &[], 0, SELF_PID).await;
        assert_eq!(reply.data, 0);

        // the leader on disk is free again
        let token = Token {
            space_name: "spc".into(),
            resource_name: "res".into(),
            disks: vec![res_disk.clone()],
            host_id: 1,
            sector_size: 512,
            align_size: 1024 * 1024,
            io_timeout: 1,
            ..Default::default()
        };
        let leader = paxos::leader_read(&token).await.unwrap();
        assert_eq!(leader.timestamp, LEASE_FREE);

        // log dump carries the token_id journal line
        let (reply, body) = roundtrip(&mut stream, Cmd::LogDump, 0, &[], 0, 0).await;
        assert_eq!(reply.data, 0);
        let dump: LogDumpReply = protocol::decode_body(&body).unwrap();
        assert!(dump.lines.iter().any(|l| l.contains("token_id")));

        // shutdown drains the (empty-of-holders) space and exits
        let (reply, _) = roundtrip(&mut stream, Cmd::Shutdown, 0, &[], 0, 0).await;
        assert_eq!(reply.data, 0);
        drop(stream);

        tokio::time::timeout(Duration::from_secs(15), run)
            .await
            .expect("daemon did not exit")
            .unwrap()
            .unwrap();
        std::fs::remove_file(&ls_disk.path).unwrap();
        std::fs::remove_file(&res_disk.path).unwrap();
    }

    #[tokio::test]
    async fn unregistered_acquire_rejected() {
        let daemon = Daemon::new(test_config("noreg"));
        let _ls = established_space(&daemon, "noreg-ls").await;
        let socket_path = daemon.config.socket_path();
        let run = tokio::spawn(daemon.clone().run());
        let mut stream = connect(&socket_path).await;
        let (reply, _) = roundtrip(&mut stream, Cmd::Acquire, 0, &[], 0, SELF_PID).await;
        assert_eq!(reply.data, wire_code(&Err(Error::NotRegistered)));

        daemon.cancel_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), run).await;
    }

    #[tokio::test]
    async fn kill_escalation_term_then_kill() {
        let daemon = Daemon::new(test_config("kill"));
        let ls_disk = established_space(&daemon, "kill-ls").await;

        // a victim process holding a token in the failing space
        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let token = Token {
            token_id: 1,
            space_name: "spc".into(),
            resource_name: "res".into(),
            pid,
            ..Default::default()
        };
        daemon.insert_client_for_test(pid, vec![token]).await;

        let space = daemon.registry().snapshot().await.pop().unwrap();
        space.state.lock().await.killing_pids = 1;
        assert!(!daemon.all_pids_dead(&space).await);

        // round 1: SIGTERM
        daemon.kill_pids(&space).await;
        assert_eq!(space.state.lock().await.killing_pids, 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = child.try_wait().unwrap();
        assert!(status.is_some(), "sleep should have died from SIGTERM");

        // round 2 escalates to SIGKILL without crashing on the gone pid
        daemon.kill_pids(&space).await;
        assert_eq!(space.state.lock().await.killing_pids, 3);

        // once the record is gone the space counts as drained
        daemon.cleanup_dead_client(0).await;
        assert!(daemon.all_pids_dead(&space).await);
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn tick_flags_failed_renewal_and_drains() {
        let daemon = Daemon::new(test_config("tick"));
        let ls_disk = established_space(&daemon, "tick-ls").await;

        // renewal is long overdue
        let space = daemon.registry().snapshot().await.pop().unwrap();
        space.state.lock().await.last_success = crate::monotime().saturating_sub(100);

        daemon.tick().await;
        assert!(space.state.lock().await.killing_pids >= 1);

        // nobody holds anything, so the next tick removes the space
        daemon.tick().await;
        assert!(daemon.registry().is_empty().await);
        std::fs::remove_file(&ls_disk.path).unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_no_spaces_cancels() {
        let daemon = Daemon::new(test_config("shutdown"));
        daemon.external_shutdown.store(true, Ordering::SeqCst);
        daemon.tick().await;
        assert!(daemon.cancel.is_cancelled());
    }
}
