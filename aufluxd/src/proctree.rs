use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::filters::{Bitset256, FiltersEngine, ProcMatch};
use crate::userdb::UserDb;

pub const CLEAN_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);
const CLEAN_PROCESS_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_LIMIT: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Execve,
    Pnotify,
    Procfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ancestor {
    pub pid: i32,
    /// The ancestor's exe at the time the link was made; a snapshot, not a
    /// live reference, so reparenting never invalidates it.
    pub exe: String,
}

#[derive(Debug, Clone)]
pub struct ItemState {
    pub ppid: i32,
    pub uid: i32,
    pub gid: i32,
    pub exe: String,
    pub cmdline: String,
    pub container_id: String,
    pub ancestors: Vec<Ancestor>,
    pub children: Vec<i32>,
    pub flags: Bitset256,
    pub source: Source,
    pub exec_propagation: u32,
    pub exited: bool,
    pub exit_time: Option<Instant>,
}

/// One tracked process. Readers take the item lock to copy what they need.
pub struct ProcessTreeItem {
    pub pid: i32,
    state: Mutex<ItemState>,
}

impl ProcessTreeItem {
    fn new(source: Source, pid: i32, ppid: i32) -> Arc<ProcessTreeItem> {
        Arc::new(ProcessTreeItem {
            pid,
            state: Mutex::new(ItemState {
                ppid,
                uid: -1,
                gid: -1,
                exe: String::new(),
                cmdline: String::new(),
                container_id: String::new(),
                ancestors: Vec::new(),
                children: Vec::new(),
                flags: Bitset256::new(),
                source,
                exec_propagation: 0,
                exited: false,
                exit_time: None,
            }),
        })
    }

    pub fn state(&self) -> ItemState {
        self.state.lock().unwrap().clone()
    }

    pub fn flags(&self) -> Bitset256 {
        self.state.lock().unwrap().flags
    }

    pub fn exe(&self) -> String {
        self.state.lock().unwrap().exe.clone()
    }

    pub fn container_id(&self) -> String {
        self.state.lock().unwrap().container_id.clone()
    }
}

#[derive(Debug)]
pub enum Command {
    Fork { pid: i32, ppid: i32 },
    Exec { pid: i32 },
    Exit { pid: i32 },
    Execve {
        pid: i32,
        ppid: i32,
        uid: i32,
        gid: i32,
        exe: String,
        cmdline: String,
    },
}

/// Live map of running processes, fused from the netlink process connector,
/// execve audit records and `/proc` scans.
///
/// All mutation happens on the single mutator thread; producers enqueue
/// commands and readers lock individual items.
pub struct ProcessTree {
    user_db: Arc<UserDb>,
    engine: Arc<FiltersEngine>,
    processes: Mutex<HashMap<i32, Arc<ProcessTreeItem>>>,
    queue: Mutex<VecDeque<Command>>,
    queue_cond: Condvar,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTree {
    pub fn new(user_db: Arc<UserDb>, engine: Arc<FiltersEngine>) -> Arc<ProcessTree> {
        Arc::new(ProcessTree {
            user_db,
            engine,
            processes: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let tree = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("proctree".to_string())
            .spawn(move || tree.run())?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.queue_cond.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn enqueue(&self, cmd: Command) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= COMMAND_QUEUE_LIMIT {
            log::warn!("process event queue full; dropping {cmd:?}");
            return;
        }
        queue.push_back(cmd);
        drop(queue);
        self.queue_cond.notify_one();
    }

    fn run(&self) {
        let mut last_clean = Instant::now();
        let mut queue = self.queue.lock().unwrap();
        while !self.stopping.load(Ordering::Relaxed) {
            if queue.is_empty() {
                let (guard, _) = self
                    .queue_cond
                    .wait_timeout(queue, Duration::from_millis(100))
                    .unwrap();
                queue = guard;
            }
            while let Some(cmd) = queue.pop_front() {
                drop(queue);
                self.handle_command(cmd);
                queue = self.queue.lock().unwrap();
            }
            if last_clean.elapsed() > CLEAN_PROCESS_INTERVAL {
                drop(queue);
                self.clean_with(CLEAN_PROCESS_TIMEOUT);
                last_clean = Instant::now();
                queue = self.queue.lock().unwrap();
            }
        }
    }

    pub(crate) fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Fork { pid, ppid } => self.add_pn_fork(pid, ppid),
            Command::Exec { pid } => self.add_pn_exec(pid),
            Command::Exit { pid } => self.remove_pid(pid),
            Command::Execve {
                pid,
                ppid,
                uid,
                gid,
                exe,
                cmdline,
            } => {
                self.add_execve(pid, ppid, uid, gid, &exe, &cmdline);
            }
        }
    }

    /// Fork seen on the process connector: create the child from the
    /// parent's state.
    fn add_pn_fork(&self, pid: i32, ppid: i32) {
        let mut processes = self.processes.lock().unwrap();
        if processes.contains_key(&pid) {
            return;
        }
        let item = ProcessTreeItem::new(Source::Pnotify, pid, ppid);
        if ppid != 0 {
            if let Some(parent) = processes.get(&ppid) {
                let parent_state = parent.state();
                {
                    let mut state = item.state.lock().unwrap();
                    state.uid = parent_state.uid;
                    state.gid = parent_state.gid;
                    state.exe = parent_state.exe.clone();
                    state.cmdline = parent_state.cmdline.clone();
                    state.container_id = parent_state.container_id.clone();
                    state.exec_propagation = parent_state.exec_propagation;
                    state.ancestors = parent_state.ancestors.clone();
                    state.ancestors.push(Ancestor {
                        pid: ppid,
                        exe: parent_state.exe,
                    });
                }
                parent.state.lock().unwrap().children.push(pid);
                processes.insert(pid, Arc::clone(&item));
                self.apply_flags_locked(&processes, &item);
                return;
            }
        }
        item.state.lock().unwrap().ancestors.push(Ancestor {
            pid: ppid,
            exe: String::new(),
        });
        processes.insert(pid, item);
    }

    /// Exec seen on the process connector: remember that the next execve
    /// audit record must refresh this process (and freshly forked children).
    fn add_pn_exec(&self, pid: i32) {
        let mut processes = self.processes.lock().unwrap();
        match processes.get(&pid) {
            Some(item) => {
                let mut state = item.state.lock().unwrap();
                if state.source == Source::Pnotify {
                    state.exec_propagation += 1;
                }
            }
            None => {
                let item = ProcessTreeItem::new(Source::Pnotify, pid, 0);
                item.state.lock().unwrap().exec_propagation = 1;
                processes.insert(pid, item);
            }
        }
    }

    /// Execve audit record: authoritative process details.
    pub(crate) fn add_execve(
        &self,
        pid: i32,
        ppid: i32,
        uid: i32,
        gid: i32,
        exe: &str,
        cmdline: &str,
    ) -> Arc<ProcessTreeItem> {
        let exe = exe
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(exe);
        let mut processes = self.processes.lock().unwrap();
        let item = match processes.get(&pid) {
            Some(item) => {
                let item = Arc::clone(item);
                let old_ppid;
                {
                    let mut state = item.state.lock().unwrap();
                    old_ppid = state.ppid;
                    state.source = Source::Execve;
                    state.uid = uid;
                    state.gid = gid;
                    state.exe = exe.to_string();
                    state.cmdline = cmdline.to_string();
                    if state.exec_propagation > 0 {
                        state.exec_propagation -= 1;
                    }
                }
                if ppid != old_ppid {
                    if let Some(old_parent) = processes.get(&old_ppid) {
                        old_parent
                            .state
                            .lock()
                            .unwrap()
                            .children
                            .retain(|c| *c != pid);
                    }
                    if let Some(parent) = processes.get(&ppid) {
                        parent.state.lock().unwrap().children.push(pid);
                        let parent_state = parent.state();
                        let mut state = item.state.lock().unwrap();
                        state.ancestors = parent_state.ancestors;
                        state.ancestors.push(Ancestor {
                            pid: ppid,
                            exe: parent_state.exe,
                        });
                    }
                    item.state.lock().unwrap().ppid = ppid;
                }
                // forked children waiting on this exec inherit the new image
                let (children, ancestors) = {
                    let state = item.state.lock().unwrap();
                    (state.children.clone(), state.ancestors.clone())
                };
                for child_pid in children {
                    let Some(child) = processes.get(&child_pid).map(Arc::clone) else {
                        continue;
                    };
                    let pending = {
                        let mut child_state = child.state.lock().unwrap();
                        if child_state.exec_propagation == 0 {
                            false
                        } else {
                            child_state.source = Source::Execve;
                            child_state.exe = exe.to_string();
                            child_state.cmdline = cmdline.to_string();
                            child_state.uid = uid;
                            child_state.gid = gid;
                            child_state.ancestors = ancestors.clone();
                            child_state.ancestors.push(Ancestor {
                                pid,
                                exe: exe.to_string(),
                            });
                            child_state.exec_propagation -= 1;
                            true
                        }
                    };
                    if pending {
                        self.apply_flags_locked(&processes, &child);
                    }
                }
                item
            }
            None => {
                let item = ProcessTreeItem::new(Source::Execve, pid, ppid);
                {
                    let mut state = item.state.lock().unwrap();
                    state.uid = uid;
                    state.gid = gid;
                    state.exe = exe.to_string();
                    state.cmdline = cmdline.to_string();
                }
                if let Some(parent) = processes.get(&ppid) {
                    parent.state.lock().unwrap().children.push(pid);
                    let parent_state = parent.state();
                    let mut state = item.state.lock().unwrap();
                    state.ancestors = parent_state.ancestors;
                    state.ancestors.push(Ancestor {
                        pid: ppid,
                        exe: parent_state.exe,
                    });
                    state.container_id = parent_state.container_id;
                }
                processes.insert(pid, Arc::clone(&item));
                item
            }
        };
        if let Some(container_id) = extract_container_id(exe, cmdline) {
            self.set_container_id(&processes, &item, &container_id);
        }
        self.apply_flags_locked(&processes, &item);
        item
    }

    /// Exit seen on the process connector. Physical removal happens in
    /// `clean`.
    fn remove_pid(&self, pid: i32) {
        let processes = self.processes.lock().unwrap();
        if let Some(item) = processes.get(&pid) {
            let mut state = item.state.lock().unwrap();
            state.exited = true;
            state.exit_time = Some(Instant::now());
        }
    }

    pub fn clean(&self) {
        self.clean_with(CLEAN_PROCESS_TIMEOUT);
    }

    pub(crate) fn clean_with(&self, timeout: Duration) {
        let mut processes = self.processes.lock().unwrap();
        processes.retain(|_, item| {
            let state = item.state.lock().unwrap();
            match (state.exited, state.exit_time) {
                (true, Some(at)) => at.elapsed() <= timeout,
                _ => true,
            }
        });
    }

    /// Process info for filtering; falls back to a `/proc` read when the
    /// table has no authoritative entry.
    pub fn get_info_for_pid(&self, pid: i32) -> Option<Arc<ProcessTreeItem>> {
        {
            let processes = self.processes.lock().unwrap();
            if let Some(item) = processes.get(&pid) {
                if item.state.lock().unwrap().source != Source::Pnotify {
                    return Some(Arc::clone(item));
                }
            }
        }
        let entry = read_proc_entry(pid)?;
        let mut processes = self.processes.lock().unwrap();
        let item = ProcessTreeItem::new(Source::Procfs, pid, entry.ppid);
        {
            let mut state = item.state.lock().unwrap();
            state.uid = entry.uid;
            state.gid = entry.gid;
            state.exe = entry.exe.clone();
            state.cmdline = entry.cmdline.clone();
        }
        if let Some(parent) = processes.get(&entry.ppid) {
            parent.state.lock().unwrap().children.push(pid);
            let parent_state = parent.state();
            let mut state = item.state.lock().unwrap();
            state.ancestors = parent_state.ancestors;
            state.ancestors.push(Ancestor {
                pid: entry.ppid,
                exe: parent_state.exe,
            });
            state.container_id = parent_state.container_id;
        }
        processes.insert(pid, Arc::clone(&item));
        self.apply_flags_locked(&processes, &item);
        Some(item)
    }

    /// Scan `/proc` and build the initial tree.
    pub fn populate(&self) {
        let mut processes = self.processes.lock().unwrap();
        let Ok(iter) = procfs::process::all_processes() else {
            log::warn!("unable to scan /proc; starting with an empty process tree");
            return;
        };
        for proc_entry in iter.flatten() {
            let pid = proc_entry.pid;
            if let Some(entry) = read_proc_process(&proc_entry) {
                let item = ProcessTreeItem::new(Source::Procfs, pid, entry.ppid);
                {
                    let mut state = item.state.lock().unwrap();
                    state.ppid = entry.ppid;
                    state.uid = entry.uid;
                    state.gid = entry.gid;
                    state.exe = entry.exe;
                    state.cmdline = entry.cmdline;
                }
                processes.insert(pid, item);
            }
        }

        // children
        let pairs: Vec<(i32, i32)> = processes
            .values()
            .map(|item| (item.pid, item.state.lock().unwrap().ppid))
            .collect();
        for (pid, ppid) in &pairs {
            if let Some(parent) = processes.get(ppid) {
                parent.state.lock().unwrap().children.push(*pid);
            }
        }

        // ancestors, root first
        for (pid, _) in &pairs {
            let mut chain = Vec::new();
            let mut cursor = processes
                .get(pid)
                .map(|item| item.state.lock().unwrap().ppid)
                .unwrap_or(0);
            while let Some(parent) = processes.get(&cursor) {
                let parent_state = parent.state.lock().unwrap();
                chain.push(Ancestor {
                    pid: cursor,
                    exe: parent_state.exe.clone(),
                });
                cursor = parent_state.ppid;
                if cursor == 0 || chain.len() > 512 {
                    break;
                }
            }
            chain.reverse();
            if let Some(item) = processes.get(pid) {
                item.state.lock().unwrap().ancestors = chain;
            }
        }

        // container ids, parents before children so inheritance works
        let mut by_depth: Vec<Arc<ProcessTreeItem>> = processes.values().cloned().collect();
        by_depth.sort_by_key(|item| item.state.lock().unwrap().ancestors.len());
        for item in by_depth {
            let (exe, cmdline, ppid, own) = {
                let state = item.state.lock().unwrap();
                (
                    state.exe.clone(),
                    state.cmdline.clone(),
                    state.ppid,
                    !state.container_id.is_empty(),
                )
            };
            if let Some(id) = extract_container_id(&exe, &cmdline) {
                item.state.lock().unwrap().container_id = id;
            } else if !own {
                if let Some(parent) = processes.get(&ppid) {
                    let inherited = parent.state.lock().unwrap().container_id.clone();
                    if !inherited.is_empty() {
                        item.state.lock().unwrap().container_id = inherited;
                    }
                }
            }
        }

        let items: Vec<Arc<ProcessTreeItem>> = processes.values().cloned().collect();
        for item in items {
            self.apply_flags_locked(&processes, &item);
        }
        log::info!("process tree populated with {} processes", processes.len());
    }

    /// Recompute every item's flags; called when filter sets change.
    pub fn update_flags(&self) {
        let processes = self.processes.lock().unwrap();
        let items: Vec<Arc<ProcessTreeItem>> = processes.values().cloned().collect();
        for item in items {
            self.apply_flags_locked(&processes, &item);
        }
    }

    pub fn len(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn user_name(&self, uid: i32) -> String {
        if uid < 0 {
            String::new()
        } else {
            self.user_db.lookup_user(uid as u32)
        }
    }

    /// `flags = closure of filter matches against the item and its
    /// ancestors`; nearest ancestors first, stopping once non-empty.
    fn apply_flags_locked(
        &self,
        processes: &HashMap<i32, Arc<ProcessTreeItem>>,
        item: &Arc<ProcessTreeItem>,
    ) {
        let (exe, cmdline, uid, ancestors) = {
            let state = item.state.lock().unwrap();
            (
                state.exe.clone(),
                state.cmdline.clone(),
                state.uid,
                state.ancestors.clone(),
            )
        };
        let user = self.user_name(uid);
        let mut flags = self.engine.get_flags(
            &ProcMatch {
                exe: &exe,
                cmdline: &cmdline,
                user: &user,
            },
            0,
        );
        if flags.none() {
            let mut height = 0u32;
            for ancestor in ancestors.iter().rev() {
                height += 1;
                let Some(anc_item) = processes.get(&ancestor.pid) else {
                    continue;
                };
                let (anc_exe, anc_cmdline, anc_uid) = {
                    let state = anc_item.state.lock().unwrap();
                    (state.exe.clone(), state.cmdline.clone(), state.uid)
                };
                let anc_user = self.user_name(anc_uid);
                flags = self.engine.get_flags(
                    &ProcMatch {
                        exe: &anc_exe,
                        cmdline: &anc_cmdline,
                        user: &anc_user,
                    },
                    height,
                );
                if !flags.none() {
                    break;
                }
            }
        }
        item.state.lock().unwrap().flags = flags;
    }

    /// Store the short container id on `item` and push it down to
    /// descendants that have none of their own.
    fn set_container_id(
        &self,
        processes: &HashMap<i32, Arc<ProcessTreeItem>>,
        item: &Arc<ProcessTreeItem>,
        container_id: &str,
    ) {
        {
            let mut state = item.state.lock().unwrap();
            state.container_id = container_id.to_string();
        }
        let mut pending: Vec<i32> = item.state.lock().unwrap().children.clone();
        let mut visited = 0;
        while let Some(pid) = pending.pop() {
            visited += 1;
            if visited > 4096 {
                break;
            }
            let Some(child) = processes.get(&pid) else {
                continue;
            };
            let mut state = child.state.lock().unwrap();
            if state.container_id.is_empty() {
                state.container_id = container_id.to_string();
                pending.extend(state.children.iter().copied());
            }
        }
    }
}

struct ProcEntry {
    ppid: i32,
    uid: i32,
    gid: i32,
    exe: String,
    cmdline: String,
}

fn read_proc_entry(pid: i32) -> Option<ProcEntry> {
    let process = procfs::process::Process::new(pid).ok()?;
    read_proc_process(&process)
}

fn read_proc_process(process: &procfs::process::Process) -> Option<ProcEntry> {
    let stat = process.stat().ok()?;
    let status = process.status().ok()?;
    let exe = process
        .exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let cmdline = process.cmdline().map(|v| v.join(" ")).unwrap_or_default();
    Some(ProcEntry {
        ppid: stat.ppid,
        uid: status.ruid as i32,
        gid: status.rgid as i32,
        exe,
        cmdline,
    })
}

/// Extract the container id from a containerd/docker shim command line.
///
/// Shims carry the 64-hex container id either as `-id <hex>` or as the
/// trailing component of `-workdir <...>/<hex>`. The stored id is the
/// familiar 12-character prefix.
pub fn extract_container_id(exe: &str, cmdline: &str) -> Option<String> {
    let basename = exe.rsplit('/').next().unwrap_or(exe);
    if !basename.starts_with("containerd-shim") && !basename.starts_with("docker-containerd-shim")
    {
        return None;
    }
    let mut args = cmdline.split_whitespace().peekable();
    while let Some(arg) = args.next() {
        let value = match arg {
            "-id" | "--id" => args.peek().copied(),
            "-workdir" | "--workdir" => args.peek().copied().and_then(|p| p.rsplit('/').next()),
            _ => continue,
        };
        if let Some(candidate) = value {
            if candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Some(candidate[..12].to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// netlink process connector listener

const NETLINK_CONNECTOR: libc::c_int = 11;
const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;
const PROC_CN_MCAST_LISTEN: u32 = 1;
const NLMSG_DONE: u16 = 3;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSG_HDR_LEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const PROC_EVENT_DATA: usize = NLMSG_HDR_LEN + CN_MSG_LEN + 16;

/// Listener feeding kernel fork/exec/exit notifications into the tree's
/// command queue.
pub struct ProcessNotify {
    tree: Arc<ProcessTree>,
    stopping: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessNotify {
    pub fn new(tree: Arc<ProcessTree>) -> ProcessNotify {
        ProcessNotify {
            tree,
            stopping: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let fd = match init_proc_socket() {
            Ok(fd) => fd,
            Err(err) => {
                // without the connector the tree still works off execve
                // records and /proc reads
                log::error!("process connector unavailable: {err}");
                return Ok(());
            }
        };
        let tree = Arc::clone(&self.tree);
        let stopping = Arc::clone(&self.stopping);
        let handle = std::thread::Builder::new()
            .name("pnotify".to_string())
            .spawn(move || {
                run_proc_listener(fd, &tree, &stopping);
                unsafe { libc::close(fd) };
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn init_proc_socket() -> anyhow::Result<libc::c_int> {
    let fd = unsafe {
        libc::socket(
            libc::PF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            NETLINK_CONNECTOR,
        )
    };
    if fd < 0 {
        anyhow::bail!(
            "cannot create netlink connector socket: {}",
            std::io::Error::last_os_error()
        );
    }

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = CN_IDX_PROC;
    addr.nl_pid = std::process::id();
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        anyhow::bail!("cannot bind netlink connector socket: {err}");
    }

    // nlmsghdr + cn_msg + proc_cn_mcast_op
    let total = NLMSG_HDR_LEN + CN_MSG_LEN + 4;
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes()); // nlmsg_len
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes()); // nlmsg_type
    msg.extend_from_slice(&0u16.to_ne_bytes()); // nlmsg_flags
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    msg.extend_from_slice(&std::process::id().to_ne_bytes()); // nlmsg_pid
    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&4u16.to_ne_bytes()); // len
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    msg.extend_from_slice(&PROC_CN_MCAST_LISTEN.to_ne_bytes());

    let sent = unsafe { libc::send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
    if sent < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        anyhow::bail!("cannot subscribe to process events: {err}");
    }
    Ok(fd)
}

fn run_proc_listener(fd: libc::c_int, tree: &ProcessTree, stopping: &AtomicBool) {
    log::info!("process connector listener started");
    let mut buf = [0u8; 4096];
    while !stopping.load(Ordering::Relaxed) {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, 250) };
        if rc <= 0 {
            continue;
        }
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            log::error!(
                "error receiving from process connector: {}",
                std::io::Error::last_os_error()
            );
            continue;
        }
        if (n as usize) < PROC_EVENT_DATA + 8 {
            continue;
        }
        let what = read_u32_ne(&buf, NLMSG_HDR_LEN + CN_MSG_LEN);
        let data = PROC_EVENT_DATA;
        match what {
            PROC_EVENT_FORK if (n as usize) >= PROC_EVENT_DATA + 16 => {
                let parent_tgid = read_i32_ne(&buf, data + 4);
                let child_tgid = read_i32_ne(&buf, data + 12);
                tree.enqueue(Command::Fork {
                    pid: child_tgid,
                    ppid: parent_tgid,
                });
            }
            PROC_EVENT_EXEC => {
                let tgid = read_i32_ne(&buf, data + 4);
                tree.enqueue(Command::Exec { pid: tgid });
            }
            PROC_EVENT_EXIT => {
                let pid = read_i32_ne(&buf, data);
                let tgid = read_i32_ne(&buf, data + 4);
                if pid == tgid {
                    tree.enqueue(Command::Exit { pid: tgid });
                }
            }
            _ => {}
        }
    }
    log::info!("process connector listener stopped");
}

fn read_u32_ne(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_i32_ne(buf: &[u8], off: usize) -> i32 {
    i32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{parse_filter_specs, FiltersEngine};
    use serde_json::json;

    fn test_tree() -> (tempfile::TempDir, Arc<ProcessTree>, Arc<FiltersEngine>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("passwd"),
            "root:x:0:0:root:/root:/bin/bash\nsvc:x:500:500::/home/svc:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("group"), "root:x:0:\nsvc:x:500:\n").unwrap();
        let user_db = UserDb::new(dir.path());
        user_db.update();
        let engine = Arc::new(FiltersEngine::new());
        let tree = ProcessTree::new(user_db, Arc::clone(&engine));
        (dir, tree, engine)
    }

    fn state_of(tree: &ProcessTree, pid: i32) -> ItemState {
        tree.processes
            .lock()
            .unwrap()
            .get(&pid)
            .expect("pid not in tree")
            .state()
    }

    fn has_pid(tree: &ProcessTree, pid: i32) -> bool {
        tree.processes.lock().unwrap().contains_key(&pid)
    }

    #[test]
    fn fork_inherits_parent_state() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(100, 1, 0, 0, "/usr/sbin/sshd", "sshd -D");
        tree.handle_command(Command::Fork { pid: 101, ppid: 100 });

        let child = state_of(&tree, 101);
        assert_eq!(child.ppid, 100);
        assert_eq!(child.exe, "/usr/sbin/sshd");
        assert_eq!(child.cmdline, "sshd -D");
        assert_eq!(child.source, Source::Pnotify);
        assert_eq!(child.ancestors.last().unwrap().pid, 100);

        let parent = state_of(&tree, 100);
        assert!(parent.children.contains(&101));
    }

    #[test]
    fn execve_reparents_and_updates_children_lists() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(10, 1, 0, 0, "/bin/old-parent", "old-parent");
        tree.add_execve(20, 1, 0, 0, "/bin/new-parent", "new-parent");
        tree.handle_command(Command::Fork { pid: 30, ppid: 10 });

        tree.add_execve(30, 20, 500, 500, "/bin/child", "child --run");

        let child = state_of(&tree, 30);
        assert_eq!(child.ppid, 20);
        assert_eq!(child.source, Source::Execve);
        assert_eq!(child.ancestors.last().unwrap().pid, 20);
        assert!(!state_of(&tree, 10).children.contains(&30));
        assert!(state_of(&tree, 20).children.contains(&30));
    }

    #[test]
    fn quoted_exe_is_unwrapped() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(50, 1, 0, 0, "\"/usr/bin/python3\"", "python3 app.py");
        assert_eq!(state_of(&tree, 50).exe, "/usr/bin/python3");
    }

    #[test]
    fn exec_propagation_cascades_to_pending_children() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(200, 1, 0, 0, "/bin/bash", "bash");
        tree.handle_command(Command::Fork { pid: 201, ppid: 200 });
        tree.handle_command(Command::Exec { pid: 201 });
        // the child is pending an exec; the parent pid's execve record
        // arrives attributed to the parent entry
        let prop_before = state_of(&tree, 201).exec_propagation;
        assert_eq!(prop_before, 1);
        tree.add_execve(200, 1, 0, 0, "/usr/bin/find", "find /tmp");
        let child = state_of(&tree, 201);
        assert_eq!(child.exe, "/usr/bin/find");
        assert_eq!(child.exec_propagation, 0);
        assert_eq!(child.source, Source::Execve);
    }

    #[test]
    fn exit_marks_then_clean_removes() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(300, 1, 0, 0, "/bin/true", "true");
        tree.handle_command(Command::Exit { pid: 300 });
        assert!(state_of(&tree, 300).exited);
        // still present inside the grace period
        tree.clean_with(Duration::from_secs(60));
        assert!(has_pid(&tree, 300));
        tree.clean_with(Duration::ZERO);
        assert!(!has_pid(&tree, 300));
    }

    #[test]
    fn flags_match_process_and_ancestors() {
        let (_dir, tree, engine) = test_tree();
        let specs = parse_filter_specs(&json!([
            {"exe": "/usr/bin/agent", "depth": 2, "syscalls": ["*"]}
        ]))
        .unwrap();
        let mask = engine.add_filter_list(&specs, "out");
        tree.update_flags();

        tree.add_execve(400, 1, 0, 0, "/usr/bin/agent", "agent");
        assert!(!state_of(&tree, 400).flags.and(mask).none());

        // children that exec their own images still match via ancestry,
        // up to the spec's depth bound
        tree.handle_command(Command::Fork { pid: 401, ppid: 400 });
        tree.add_execve(401, 400, 0, 0, "/bin/mid", "mid");
        assert!(!state_of(&tree, 401).flags.none());

        tree.handle_command(Command::Fork { pid: 402, ppid: 401 });
        tree.add_execve(402, 401, 0, 0, "/bin/sh", "sh -c work");
        assert!(!state_of(&tree, 402).flags.none());

        // beyond the depth bound the match stops
        tree.handle_command(Command::Fork { pid: 403, ppid: 402 });
        tree.add_execve(403, 402, 0, 0, "/bin/sleep", "sleep 1");
        assert!(state_of(&tree, 403).flags.none());
    }

    #[test]
    fn update_flags_recomputes_after_filter_change() {
        let (_dir, tree, engine) = test_tree();
        tree.add_execve(500, 1, 500, 500, "/opt/tool", "tool");
        assert!(state_of(&tree, 500).flags.none());

        let specs = parse_filter_specs(&json!([
            {"exe": "/opt/tool", "user": "svc"}
        ]))
        .unwrap();
        engine.add_filter_list(&specs, "out");
        tree.update_flags();
        assert!(!state_of(&tree, 500).flags.none());

        engine.remove_filter_list(&specs, "out");
        tree.update_flags();
        assert!(state_of(&tree, 500).flags.none());
    }

    #[test]
    fn container_id_from_workdir_argument() {
        let exe = "/containerd-shim";
        let cmdline = "containerd-shim -namespace moby -workdir \
            /var/lib/containerd/io.containerd.runtime.v1.linux/moby/\
            ebe83cd204c57dc745ce21b595e6aaabf805dc4046024e8eacb84633d2461ec1 \
            -address /run/containerd/containerd.sock";
        assert_eq!(
            extract_container_id(exe, cmdline).as_deref(),
            Some("ebe83cd204c5")
        );
    }

    #[test]
    fn container_id_from_id_argument() {
        let exe = "/usr/bin/containerd-shim-runc-v2";
        let cmdline = "containerd-shim-runc-v2 -namespace moby -id \
            ebe83cd204c57dc745ce21b595e6aaabf805dc4046024e8eacb84633d2461ec1 \
            -address /run/containerd/containerd.sock";
        assert_eq!(
            extract_container_id(exe, cmdline).as_deref(),
            Some("ebe83cd204c5")
        );
    }

    #[test]
    fn container_id_requires_shim_exe() {
        assert_eq!(
            extract_container_id(
                "/usr/bin/python3",
                "python3 -id ebe83cd204c57dc745ce21b595e6aaabf805dc4046024e8eacb84633d2461ec1"
            ),
            None
        );
        assert_eq!(
            extract_container_id("/containerd-shim", "containerd-shim -id tooshort"),
            None
        );
    }

    #[test]
    fn container_id_propagates_to_descendants() {
        let (_dir, tree, _) = test_tree();
        tree.add_execve(
            600,
            1,
            0,
            0,
            "/containerd-shim-runc-v2",
            "containerd-shim-runc-v2 -id \
             ebe83cd204c57dc745ce21b595e6aaabf805dc4046024e8eacb84633d2461ec1",
        );
        tree.handle_command(Command::Fork { pid: 601, ppid: 600 });
        tree.add_execve(601, 600, 0, 0, "/bin/sh", "sh");
        assert_eq!(state_of(&tree, 600).container_id, "ebe83cd204c5");
        assert_eq!(state_of(&tree, 601).container_id, "ebe83cd204c5");
    }

    #[test]
    fn mutator_thread_applies_queued_commands() {
        let (_dir, tree, _) = test_tree();
        tree.start().unwrap();
        tree.enqueue(Command::Execve {
            pid: 700,
            ppid: 1,
            uid: 0,
            gid: 0,
            exe: "/bin/demo".to_string(),
            cmdline: "demo".to_string(),
        });
        let mut seen = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(10));
            if has_pid(&tree, 700) {
                seen = true;
                break;
            }
        }
        tree.stop();
        assert!(seen, "queued execve not applied by mutator thread");
    }
}
