use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

/// Name cache over `<dir>/passwd` and `<dir>/group`.
///
/// Lookups read a snapshot map and never block; a watcher thread reloads the
/// maps when the files change. The directory is configurable to make the
/// cache testable; the daemon points it at `/etc`.
pub struct UserDb {
    dir: PathBuf,
    users: DashMap<u32, String>,
    groups: DashMap<u32, String>,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UserDb {
    pub fn new(dir: &Path) -> Arc<UserDb> {
        Arc::new(UserDb {
            dir: dir.to_path_buf(),
            users: DashMap::new(),
            groups: DashMap::new(),
            stopping: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Resolved user name, or the empty string when the uid is unknown.
    pub fn lookup_user(&self, uid: u32) -> String {
        self.users.get(&uid).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn lookup_group(&self, gid: u32) -> String {
        self.groups.get(&gid).map(|v| v.clone()).unwrap_or_default()
    }

    /// Load the current file contents and start the watcher thread.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.update();
        let db = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("userdb".to_string())
            .spawn(move || db.watch_loop())?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Re-read both files into the snapshot maps.
    pub fn update(&self) {
        if let Some(users) = parse_id_file(&self.dir.join("passwd")) {
            replace_map(&self.users, users);
        }
        if let Some(groups) = parse_id_file(&self.dir.join("group")) {
            replace_map(&self.groups, groups);
        }
    }

    fn watch_loop(&self) {
        let inotify = match Inotify::init(InitFlags::IN_NONBLOCK) {
            Ok(inotify) => inotify,
            Err(err) => {
                log::error!("userdb: inotify init failed: {err}; name updates disabled");
                return;
            }
        };
        let flags = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_DELETE;
        if let Err(err) = inotify.add_watch(&self.dir, flags) {
            log::error!(
                "userdb: failed to watch {}: {err}; name updates disabled",
                self.dir.display()
            );
            return;
        }

        while !self.stopping.load(Ordering::Relaxed) {
            let fd = inotify.as_fd();
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(250u16)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("userdb: poll failed: {err}");
                    std::thread::sleep(Duration::from_millis(250));
                    continue;
                }
            }
            let relevant = match inotify.read_events() {
                Ok(events) => events.iter().any(|ev| {
                    ev.name
                        .as_deref()
                        .and_then(|n| n.to_str())
                        .map(|n| n == "passwd" || n == "group")
                        .unwrap_or(false)
                }),
                Err(nix::errno::Errno::EAGAIN) => false,
                Err(err) => {
                    log::error!("userdb: inotify read failed: {err}");
                    false
                }
            };
            if relevant {
                // edits come in bursts (tmp file + rename); settle first
                std::thread::sleep(Duration::from_millis(100));
                while matches!(inotify.read_events(), Ok(ref ev) if !ev.is_empty()) {}
                self.update();
            }
        }
    }
}

/// Parse the `name:x:id:...` format shared by passwd and group.
fn parse_id_file(path: &Path) -> Option<HashMap<u32, String>> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut map = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split(':');
        let name = parts.next()?;
        let _ = parts.next();
        let id: u32 = match parts.next().and_then(|s| s.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        map.entry(id).or_insert_with(|| name.to_string());
    }
    Some(map)
}

fn replace_map(target: &DashMap<u32, String>, fresh: HashMap<u32, String>) {
    target.retain(|id, _| fresh.contains_key(id));
    for (id, name) in fresh {
        target.insert(id, name);
    }
}
