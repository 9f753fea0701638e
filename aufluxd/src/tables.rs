use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Classification assigned to each parsed field.
///
/// The numeric values are part of the on-disk event payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    Unclassified = 0,
    Uid = 1,
    Gid = 2,
    Syscall = 3,
    Arch = 4,
    Exit = 5,
    Escaped = 6,
    Perm = 7,
    Mode = 8,
    Sockaddr = 9,
    Flags = 10,
    Proctitle = 11,
    Session = 12,
}

impl FieldType {
    pub fn from_u16(v: u16) -> FieldType {
        match v {
            1 => FieldType::Uid,
            2 => FieldType::Gid,
            3 => FieldType::Syscall,
            4 => FieldType::Arch,
            5 => FieldType::Exit,
            6 => FieldType::Escaped,
            7 => FieldType::Perm,
            8 => FieldType::Mode,
            9 => FieldType::Sockaddr,
            10 => FieldType::Flags,
            11 => FieldType::Proctitle,
            12 => FieldType::Session,
            _ => FieldType::Unclassified,
        }
    }
}

pub const RECORD_TYPE_SYSCALL: u32 = 1300;
pub const RECORD_TYPE_EXECVE: u32 = 1309;
pub const RECORD_TYPE_EOE: u32 = 1320;
pub const RECORD_TYPE_PROCTITLE: u32 = 1327;

/// Kernel audit record types. Sorted by code for binary search.
static RECORD_TYPES: &[(u32, &str)] = &[
    (1000, "GET"),
    (1001, "SET"),
    (1002, "LIST"),
    (1003, "ADD"),
    (1004, "DEL"),
    (1005, "USER"),
    (1006, "LOGIN"),
    (1100, "USER_AUTH"),
    (1101, "USER_ACCT"),
    (1102, "USER_MGMT"),
    (1103, "CRED_ACQ"),
    (1104, "CRED_DISP"),
    (1105, "USER_START"),
    (1106, "USER_END"),
    (1107, "USER_AVC"),
    (1108, "USER_CHAUTHTOK"),
    (1109, "USER_ERR"),
    (1110, "CRED_REFR"),
    (1111, "USYS_CONFIG"),
    (1112, "USER_LOGIN"),
    (1113, "USER_LOGOUT"),
    (1114, "ADD_USER"),
    (1115, "DEL_USER"),
    (1116, "ADD_GROUP"),
    (1117, "DEL_GROUP"),
    (1118, "DAC_CHECK"),
    (1119, "CHGRP_ID"),
    (1120, "TEST"),
    (1121, "TRUSTED_APP"),
    (1122, "USER_SELINUX_ERR"),
    (1123, "USER_CMD"),
    (1124, "USER_TTY"),
    (1125, "CHUSER_ID"),
    (1126, "GRP_AUTH"),
    (1127, "SYSTEM_BOOT"),
    (1128, "SYSTEM_SHUTDOWN"),
    (1129, "SYSTEM_RUNLEVEL"),
    (1130, "SERVICE_START"),
    (1131, "SERVICE_STOP"),
    (1132, "GRP_MGMT"),
    (1133, "GRP_CHAUTHTOK"),
    (1200, "DAEMON_START"),
    (1201, "DAEMON_END"),
    (1202, "DAEMON_ABORT"),
    (1203, "DAEMON_CONFIG"),
    (1204, "DAEMON_ROTATE"),
    (1205, "DAEMON_RESUME"),
    (1206, "DAEMON_ACCEPT"),
    (1207, "DAEMON_CLOSE"),
    (1208, "DAEMON_ERR"),
    (1300, "SYSCALL"),
    (1301, "FS_WATCH"),
    (1302, "PATH"),
    (1303, "IPC"),
    (1304, "SOCKETCALL"),
    (1305, "CONFIG_CHANGE"),
    (1306, "SOCKADDR"),
    (1307, "CWD"),
    (1309, "EXECVE"),
    (1311, "IPC_SET_PERM"),
    (1312, "MQ_OPEN"),
    (1313, "MQ_SENDRECV"),
    (1314, "MQ_NOTIFY"),
    (1315, "MQ_GETSETATTR"),
    (1316, "KERNEL_OTHER"),
    (1317, "FD_PAIR"),
    (1318, "OBJ_PID"),
    (1319, "TTY"),
    (1320, "EOE"),
    (1321, "BPRM_FCAPS"),
    (1322, "CAPSET"),
    (1323, "MMAP"),
    (1324, "NETFILTER_PKT"),
    (1325, "NETFILTER_CFG"),
    (1326, "SECCOMP"),
    (1327, "PROCTITLE"),
    (1328, "FEATURE_CHANGE"),
    (1329, "REPLACE"),
    (1330, "KERN_MODULE"),
    (1331, "FANOTIFY"),
    (1332, "TIME_INJOFFSET"),
    (1333, "TIME_ADJNTPVAL"),
    (1334, "BPF"),
    (1335, "EVENT_LISTENER"),
    (1336, "URINGOP"),
    (1337, "OPENAT2"),
    (1338, "DM_CTRL"),
    (1339, "DM_EVENT"),
    (1400, "AVC"),
    (1401, "SELINUX_ERR"),
    (1402, "AVC_PATH"),
    (1403, "MAC_POLICY_LOAD"),
    (1404, "MAC_STATUS"),
    (1405, "MAC_CONFIG_CHANGE"),
    (1406, "MAC_UNLBL_ALLOW"),
    (1407, "MAC_CIPSOV4_ADD"),
    (1408, "MAC_CIPSOV4_DEL"),
    (1409, "MAC_MAP_ADD"),
    (1410, "MAC_MAP_DEL"),
    (1700, "ANOM_PROMISCUOUS"),
    (1701, "ANOM_ABEND"),
    (1702, "ANOM_LINK"),
    (1703, "ANOM_CREAT"),
    (1800, "INTEGRITY_DATA"),
    (1801, "INTEGRITY_METADATA"),
    (1802, "INTEGRITY_STATUS"),
    (1803, "INTEGRITY_HASH"),
    (1804, "INTEGRITY_PCR"),
    (1805, "INTEGRITY_RULE"),
    (2000, "KERNEL"),
];

static RECORD_NAME_TO_CODE: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    RECORD_TYPES.iter().map(|&(code, name)| (name, code)).collect()
});

pub fn record_type_name(code: u32) -> String {
    match RECORD_TYPES.binary_search_by_key(&code, |&(c, _)| c) {
        Ok(idx) => RECORD_TYPES[idx].1.to_string(),
        Err(_) => format!("UNKNOWN[{code}]"),
    }
}

pub fn record_type_code(name: &str) -> Option<u32> {
    if let Some(code) = RECORD_NAME_TO_CODE.get(name) {
        return Some(*code);
    }
    // Records from newer kernels than our table arrive as UNKNOWN[n].
    let inner = name.strip_prefix("UNKNOWN[")?.strip_suffix(']')?;
    inner.parse().ok()
}

/// Field names whose values are hex-escaped by the kernel when they contain
/// characters outside the printable set.
static ESCAPED_FIELDS: &[&str] = &[
    "acct", "cmd", "comm", "cwd", "data", "dir", "exe", "file", "grp", "key", "name", "new",
    "ocomm", "old", "path", "vm", "watch",
];

/// Classify a field by name, with the handful of record-type exceptions the
/// kernel format requires.
pub fn classify_field(record_type: u32, name: &str) -> FieldType {
    match name {
        "uid" | "auid" | "euid" | "suid" | "fsuid" | "ouid" | "oauid" | "iuid" | "sauid"
        | "obj_uid" | "id" => FieldType::Uid,
        "gid" | "egid" | "sgid" | "fsgid" | "ogid" | "igid" | "new_gid" | "obj_gid" => {
            FieldType::Gid
        }
        "syscall" => FieldType::Syscall,
        "arch" => FieldType::Arch,
        "exit" if record_type == RECORD_TYPE_SYSCALL => FieldType::Exit,
        "perm" => FieldType::Perm,
        "mode" => FieldType::Mode,
        "saddr" => FieldType::Sockaddr,
        "flags" => FieldType::Flags,
        "proctitle" => FieldType::Proctitle,
        "ses" => FieldType::Session,
        _ if ESCAPED_FIELDS.binary_search(&name).is_ok() => FieldType::Escaped,
        _ => FieldType::Unclassified,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    X86_64,
    I386,
    Aarch64,
    Arm,
    Unknown,
}

impl Machine {
    pub fn name(self) -> &'static str {
        match self {
            Machine::X86_64 => "x86_64",
            Machine::I386 => "i386",
            Machine::Aarch64 => "aarch64",
            Machine::Arm => "arm",
            Machine::Unknown => "unknown",
        }
    }
}

/// Map the raw `arch` field value (hex ELF machine + flags) to a machine.
pub fn arch_to_machine(raw: &str) -> Machine {
    let Ok(arch) = u32::from_str_radix(raw.trim_start_matches("0x"), 16) else {
        return Machine::Unknown;
    };
    match arch {
        0xC000_003E => Machine::X86_64,
        0x4000_0003 => Machine::I386,
        0xC000_00B7 => Machine::Aarch64,
        0x4000_0028 => Machine::Arm,
        _ => Machine::Unknown,
    }
}

pub fn interpret_arch(raw: &str) -> String {
    match arch_to_machine(raw) {
        Machine::Unknown => format!("unknown-arch({raw})"),
        m => m.name().to_string(),
    }
}

pub fn interpret_syscall(machine: Machine, raw: &str) -> String {
    let Ok(nr) = raw.parse::<u32>() else {
        return format!("unknown-syscall({raw})");
    };
    let name = match machine {
        Machine::X86_64 => syscall_name_x86_64(nr),
        Machine::Aarch64 => syscall_name_aarch64(nr),
        Machine::I386 | Machine::Arm => syscall_name_i386(nr),
        Machine::Unknown => None,
    };
    match name {
        Some(name) => name.to_string(),
        None => format!("unknown-syscall({raw})"),
    }
}

/// Render a `mode` field (octal) as a type name plus permission bits.
pub fn interpret_mode(raw: &str) -> String {
    let Ok(mode) = u32::from_str_radix(raw, 8) else {
        return format!("unknown-mode({raw})");
    };
    let mut out = match mode & libc::S_IFMT {
        libc::S_IFSOCK => "socket".to_string(),
        libc::S_IFLNK => "link".to_string(),
        libc::S_IFREG => "file".to_string(),
        libc::S_IFBLK => "block".to_string(),
        libc::S_IFDIR => "dir".to_string(),
        libc::S_IFCHR => "character".to_string(),
        libc::S_IFIFO => "fifo".to_string(),
        other => format!("{:03o}", other >> 12),
    };
    if mode & libc::S_ISUID != 0 {
        out.push_str(",suid");
    }
    if mode & libc::S_ISGID != 0 {
        out.push_str(",sgid");
    }
    if mode & libc::S_ISVTX != 0 {
        out.push_str(",sticky");
    }
    out.push_str(&format!("{:03o}", mode & 0o777));
    out
}

pub fn interpret_session(raw: &str) -> String {
    if raw == "4294967295" {
        "unset".to_string()
    } else {
        raw.to_string()
    }
}

/// Negative `exit` values are errnos; map them to their names.
pub fn interpret_exit(raw: &str) -> Option<String> {
    let val: i64 = raw.parse().ok()?;
    if val >= 0 {
        return None;
    }
    errno_name((-val) as i32).map(|name| format!("{name}({val})"))
}

fn errno_name(errno: i32) -> Option<&'static str> {
    static ERRNOS: &[(i32, &str)] = &[
        (1, "EPERM"),
        (2, "ENOENT"),
        (3, "ESRCH"),
        (4, "EINTR"),
        (5, "EIO"),
        (6, "ENXIO"),
        (7, "E2BIG"),
        (8, "ENOEXEC"),
        (9, "EBADF"),
        (10, "ECHILD"),
        (11, "EAGAIN"),
        (12, "ENOMEM"),
        (13, "EACCES"),
        (14, "EFAULT"),
        (15, "ENOTBLK"),
        (16, "EBUSY"),
        (17, "EEXIST"),
        (18, "EXDEV"),
        (19, "ENODEV"),
        (20, "ENOTDIR"),
        (21, "EISDIR"),
        (22, "EINVAL"),
        (23, "ENFILE"),
        (24, "EMFILE"),
        (25, "ENOTTY"),
        (26, "ETXTBSY"),
        (27, "EFBIG"),
        (28, "ENOSPC"),
        (29, "ESPIPE"),
        (30, "EROFS"),
        (31, "EMLINK"),
        (32, "EPIPE"),
        (36, "ENAMETOOLONG"),
        (38, "ENOSYS"),
        (39, "ENOTEMPTY"),
        (40, "ELOOP"),
        (61, "ENODATA"),
        (75, "EOVERFLOW"),
        (84, "EILSEQ"),
        (88, "ENOTSOCK"),
        (90, "EMSGSIZE"),
        (93, "EPROTONOSUPPORT"),
        (95, "EOPNOTSUPP"),
        (97, "EAFNOSUPPORT"),
        (98, "EADDRINUSE"),
        (99, "EADDRNOTAVAIL"),
        (100, "ENETDOWN"),
        (101, "ENETUNREACH"),
        (104, "ECONNRESET"),
        (105, "ENOBUFS"),
        (106, "EISCONN"),
        (107, "ENOTCONN"),
        (110, "ETIMEDOUT"),
        (111, "ECONNREFUSED"),
        (113, "EHOSTUNREACH"),
        (114, "EALREADY"),
        (115, "EINPROGRESS"),
        (122, "EDQUOT"),
        (125, "ECANCELED"),
    ];
    ERRNOS
        .binary_search_by_key(&errno, |&(n, _)| n)
        .ok()
        .map(|idx| ERRNOS[idx].1)
}

fn syscall_name_x86_64(nr: u32) -> Option<&'static str> {
    static TABLE: &[(u32, &str)] = &[
        (0, "read"),
        (1, "write"),
        (2, "open"),
        (3, "close"),
        (4, "stat"),
        (5, "fstat"),
        (6, "lstat"),
        (7, "poll"),
        (8, "lseek"),
        (9, "mmap"),
        (10, "mprotect"),
        (11, "munmap"),
        (12, "brk"),
        (13, "rt_sigaction"),
        (14, "rt_sigprocmask"),
        (15, "rt_sigreturn"),
        (16, "ioctl"),
        (17, "pread64"),
        (18, "pwrite64"),
        (19, "readv"),
        (20, "writev"),
        (21, "access"),
        (22, "pipe"),
        (23, "select"),
        (24, "sched_yield"),
        (25, "mremap"),
        (26, "msync"),
        (27, "mincore"),
        (28, "madvise"),
        (29, "shmget"),
        (30, "shmat"),
        (31, "shmctl"),
        (32, "dup"),
        (33, "dup2"),
        (34, "pause"),
        (35, "nanosleep"),
        (36, "getitimer"),
        (37, "alarm"),
        (38, "setitimer"),
        (39, "getpid"),
        (40, "sendfile"),
        (41, "socket"),
        (42, "connect"),
        (43, "accept"),
        (44, "sendto"),
        (45, "recvfrom"),
        (46, "sendmsg"),
        (47, "recvmsg"),
        (48, "shutdown"),
        (49, "bind"),
        (50, "listen"),
        (51, "getsockname"),
        (52, "getpeername"),
        (53, "socketpair"),
        (54, "setsockopt"),
        (55, "getsockopt"),
        (56, "clone"),
        (57, "fork"),
        (58, "vfork"),
        (59, "execve"),
        (60, "exit"),
        (61, "wait4"),
        (62, "kill"),
        (63, "uname"),
        (64, "semget"),
        (65, "semop"),
        (66, "semctl"),
        (67, "shmdt"),
        (68, "msgget"),
        (69, "msgsnd"),
        (70, "msgrcv"),
        (71, "msgctl"),
        (72, "fcntl"),
        (73, "flock"),
        (74, "fsync"),
        (75, "fdatasync"),
        (76, "truncate"),
        (77, "ftruncate"),
        (78, "getdents"),
        (79, "getcwd"),
        (80, "chdir"),
        (81, "fchdir"),
        (82, "rename"),
        (83, "mkdir"),
        (84, "rmdir"),
        (85, "creat"),
        (86, "link"),
        (87, "unlink"),
        (88, "symlink"),
        (89, "readlink"),
        (90, "chmod"),
        (91, "fchmod"),
        (92, "chown"),
        (93, "fchown"),
        (94, "lchown"),
        (95, "umask"),
        (96, "gettimeofday"),
        (97, "getrlimit"),
        (98, "getrusage"),
        (99, "sysinfo"),
        (100, "times"),
        (101, "ptrace"),
        (102, "getuid"),
        (103, "syslog"),
        (104, "getgid"),
        (105, "setuid"),
        (106, "setgid"),
        (107, "geteuid"),
        (108, "getegid"),
        (109, "setpgid"),
        (110, "getppid"),
        (111, "getpgrp"),
        (112, "setsid"),
        (113, "setreuid"),
        (114, "setregid"),
        (115, "getgroups"),
        (116, "setgroups"),
        (117, "setresuid"),
        (118, "getresuid"),
        (119, "setresgid"),
        (120, "getresgid"),
        (121, "getpgid"),
        (122, "setfsuid"),
        (123, "setfsgid"),
        (124, "getsid"),
        (125, "capget"),
        (126, "capset"),
        (127, "rt_sigpending"),
        (128, "rt_sigtimedwait"),
        (129, "rt_sigqueueinfo"),
        (130, "rt_sigsuspend"),
        (131, "sigaltstack"),
        (132, "utime"),
        (133, "mknod"),
        (134, "uselib"),
        (135, "personality"),
        (136, "ustat"),
        (137, "statfs"),
        (138, "fstatfs"),
        (139, "sysfs"),
        (140, "getpriority"),
        (141, "setpriority"),
        (142, "sched_setparam"),
        (143, "sched_getparam"),
        (144, "sched_setscheduler"),
        (145, "sched_getscheduler"),
        (146, "sched_get_priority_max"),
        (147, "sched_get_priority_min"),
        (148, "sched_rr_get_interval"),
        (149, "mlock"),
        (150, "munlock"),
        (151, "mlockall"),
        (152, "munlockall"),
        (153, "vhangup"),
        (154, "modify_ldt"),
        (155, "pivot_root"),
        (156, "_sysctl"),
        (157, "prctl"),
        (158, "arch_prctl"),
        (159, "adjtimex"),
        (160, "setrlimit"),
        (161, "chroot"),
        (162, "sync"),
        (163, "acct"),
        (164, "settimeofday"),
        (165, "mount"),
        (166, "umount2"),
        (167, "swapon"),
        (168, "swapoff"),
        (169, "reboot"),
        (170, "sethostname"),
        (171, "setdomainname"),
        (172, "iopl"),
        (173, "ioperm"),
        (175, "init_module"),
        (176, "delete_module"),
        (179, "quotactl"),
        (186, "gettid"),
        (187, "readahead"),
        (188, "setxattr"),
        (189, "lsetxattr"),
        (190, "fsetxattr"),
        (191, "getxattr"),
        (192, "lgetxattr"),
        (193, "fgetxattr"),
        (194, "listxattr"),
        (195, "llistxattr"),
        (196, "flistxattr"),
        (197, "removexattr"),
        (198, "lremovexattr"),
        (199, "fremovexattr"),
        (200, "tkill"),
        (201, "time"),
        (202, "futex"),
        (203, "sched_setaffinity"),
        (204, "sched_getaffinity"),
        (206, "io_setup"),
        (207, "io_destroy"),
        (208, "io_getevents"),
        (209, "io_submit"),
        (210, "io_cancel"),
        (212, "lookup_dcookie"),
        (213, "epoll_create"),
        (216, "remap_file_pages"),
        (217, "getdents64"),
        (218, "set_tid_address"),
        (219, "restart_syscall"),
        (220, "semtimedop"),
        (221, "fadvise64"),
        (222, "timer_create"),
        (223, "timer_settime"),
        (224, "timer_gettime"),
        (225, "timer_getoverrun"),
        (226, "timer_delete"),
        (227, "clock_settime"),
        (228, "clock_gettime"),
        (229, "clock_getres"),
        (230, "clock_nanosleep"),
        (231, "exit_group"),
        (232, "epoll_wait"),
        (233, "epoll_ctl"),
        (234, "tgkill"),
        (235, "utimes"),
        (237, "mbind"),
        (238, "set_mempolicy"),
        (239, "get_mempolicy"),
        (240, "mq_open"),
        (241, "mq_unlink"),
        (242, "mq_timedsend"),
        (243, "mq_timedreceive"),
        (244, "mq_notify"),
        (245, "mq_getsetattr"),
        (246, "kexec_load"),
        (247, "waitid"),
        (248, "add_key"),
        (249, "request_key"),
        (250, "keyctl"),
        (251, "ioprio_set"),
        (252, "ioprio_get"),
        (253, "inotify_init"),
        (254, "inotify_add_watch"),
        (255, "inotify_rm_watch"),
        (256, "migrate_pages"),
        (257, "openat"),
        (258, "mkdirat"),
        (259, "mknodat"),
        (260, "fchownat"),
        (261, "futimesat"),
        (262, "newfstatat"),
        (263, "unlinkat"),
        (264, "renameat"),
        (265, "linkat"),
        (266, "symlinkat"),
        (267, "readlinkat"),
        (268, "fchmodat"),
        (269, "faccessat"),
        (270, "pselect6"),
        (271, "ppoll"),
        (272, "unshare"),
        (273, "set_robust_list"),
        (274, "get_robust_list"),
        (275, "splice"),
        (276, "tee"),
        (277, "sync_file_range"),
        (278, "vmsplice"),
        (279, "move_pages"),
        (280, "utimensat"),
        (281, "epoll_pwait"),
        (282, "signalfd"),
        (283, "timerfd_create"),
        (284, "eventfd"),
        (285, "fallocate"),
        (286, "timerfd_settime"),
        (287, "timerfd_gettime"),
        (288, "accept4"),
        (289, "signalfd4"),
        (290, "eventfd2"),
        (291, "epoll_create1"),
        (292, "dup3"),
        (293, "pipe2"),
        (294, "inotify_init1"),
        (295, "preadv"),
        (296, "pwritev"),
        (297, "rt_tgsigqueueinfo"),
        (298, "perf_event_open"),
        (299, "recvmmsg"),
        (300, "fanotify_init"),
        (301, "fanotify_mark"),
        (302, "prlimit64"),
        (303, "name_to_handle_at"),
        (304, "open_by_handle_at"),
        (305, "clock_adjtime"),
        (306, "syncfs"),
        (307, "sendmmsg"),
        (308, "setns"),
        (309, "getcpu"),
        (310, "process_vm_readv"),
        (311, "process_vm_writev"),
        (312, "kcmp"),
        (313, "finit_module"),
        (314, "sched_setattr"),
        (315, "sched_getattr"),
        (316, "renameat2"),
        (317, "seccomp"),
        (318, "getrandom"),
        (319, "memfd_create"),
        (320, "kexec_file_load"),
        (321, "bpf"),
        (322, "execveat"),
        (323, "userfaultfd"),
        (324, "membarrier"),
        (325, "mlock2"),
        (326, "copy_file_range"),
        (327, "preadv2"),
        (328, "pwritev2"),
        (329, "pkey_mprotect"),
        (330, "pkey_alloc"),
        (331, "pkey_free"),
        (332, "statx"),
        (333, "io_pgetevents"),
        (334, "rseq"),
        (424, "pidfd_send_signal"),
        (425, "io_uring_setup"),
        (426, "io_uring_enter"),
        (427, "io_uring_register"),
        (428, "open_tree"),
        (429, "move_mount"),
        (430, "fsopen"),
        (431, "fsconfig"),
        (432, "fsmount"),
        (433, "fspick"),
        (434, "pidfd_open"),
        (435, "clone3"),
        (436, "close_range"),
        (437, "openat2"),
        (438, "pidfd_getfd"),
        (439, "faccessat2"),
        (440, "process_madvise"),
        (441, "epoll_pwait2"),
        (442, "mount_setattr"),
        (443, "quotactl_fd"),
        (444, "landlock_create_ruleset"),
        (445, "landlock_add_rule"),
        (446, "landlock_restrict_self"),
        (447, "memfd_secret"),
        (448, "process_mrelease"),
        (449, "futex_waitv"),
        (450, "set_mempolicy_home_node"),
        (451, "cachestat"),
        (452, "fchmodat2"),
    ];
    lookup(TABLE, nr)
}

fn syscall_name_aarch64(nr: u32) -> Option<&'static str> {
    static TABLE: &[(u32, &str)] = &[
        (17, "getcwd"),
        (19, "eventfd2"),
        (20, "epoll_create1"),
        (21, "epoll_ctl"),
        (22, "epoll_pwait"),
        (23, "dup"),
        (24, "dup3"),
        (25, "fcntl"),
        (26, "inotify_init1"),
        (27, "inotify_add_watch"),
        (28, "inotify_rm_watch"),
        (29, "ioctl"),
        (32, "flock"),
        (33, "mknodat"),
        (34, "mkdirat"),
        (35, "unlinkat"),
        (36, "symlinkat"),
        (37, "linkat"),
        (38, "renameat"),
        (39, "umount2"),
        (40, "mount"),
        (41, "pivot_root"),
        (43, "statfs"),
        (44, "fstatfs"),
        (45, "truncate"),
        (46, "ftruncate"),
        (47, "fallocate"),
        (48, "faccessat"),
        (49, "chdir"),
        (50, "fchdir"),
        (51, "chroot"),
        (52, "fchmod"),
        (53, "fchmodat"),
        (54, "fchownat"),
        (55, "fchown"),
        (56, "openat"),
        (57, "close"),
        (58, "vhangup"),
        (59, "pipe2"),
        (60, "quotactl"),
        (61, "getdents64"),
        (62, "lseek"),
        (63, "read"),
        (64, "write"),
        (65, "readv"),
        (66, "writev"),
        (67, "pread64"),
        (68, "pwrite64"),
        (71, "sendfile"),
        (72, "pselect6"),
        (73, "ppoll"),
        (74, "signalfd4"),
        (75, "vmsplice"),
        (76, "splice"),
        (77, "tee"),
        (78, "readlinkat"),
        (79, "newfstatat"),
        (80, "fstat"),
        (81, "sync"),
        (82, "fsync"),
        (83, "fdatasync"),
        (85, "timerfd_create"),
        (86, "timerfd_settime"),
        (87, "timerfd_gettime"),
        (88, "utimensat"),
        (89, "acct"),
        (90, "capget"),
        (91, "capset"),
        (92, "personality"),
        (93, "exit"),
        (94, "exit_group"),
        (95, "waitid"),
        (96, "set_tid_address"),
        (97, "unshare"),
        (98, "futex"),
        (99, "set_robust_list"),
        (100, "get_robust_list"),
        (101, "nanosleep"),
        (102, "getitimer"),
        (103, "setitimer"),
        (104, "kexec_load"),
        (105, "init_module"),
        (106, "delete_module"),
        (107, "timer_create"),
        (108, "timer_gettime"),
        (109, "timer_getoverrun"),
        (110, "timer_settime"),
        (111, "timer_delete"),
        (112, "clock_settime"),
        (113, "clock_gettime"),
        (114, "clock_getres"),
        (115, "clock_nanosleep"),
        (116, "syslog"),
        (117, "ptrace"),
        (118, "sched_setparam"),
        (119, "sched_setscheduler"),
        (120, "sched_getscheduler"),
        (121, "sched_getparam"),
        (122, "sched_setaffinity"),
        (123, "sched_getaffinity"),
        (124, "sched_yield"),
        (125, "sched_get_priority_max"),
        (126, "sched_get_priority_min"),
        (127, "sched_rr_get_interval"),
        (128, "restart_syscall"),
        (129, "kill"),
        (130, "tkill"),
        (131, "tgkill"),
        (132, "sigaltstack"),
        (133, "rt_sigsuspend"),
        (134, "rt_sigaction"),
        (135, "rt_sigprocmask"),
        (136, "rt_sigpending"),
        (137, "rt_sigtimedwait"),
        (138, "rt_sigqueueinfo"),
        (139, "rt_sigreturn"),
        (140, "setpriority"),
        (141, "getpriority"),
        (142, "reboot"),
        (143, "setregid"),
        (144, "setgid"),
        (145, "setreuid"),
        (146, "setuid"),
        (147, "setresuid"),
        (148, "getresuid"),
        (149, "setresgid"),
        (150, "getresgid"),
        (151, "setfsuid"),
        (152, "setfsgid"),
        (153, "times"),
        (154, "setpgid"),
        (155, "getpgid"),
        (156, "getsid"),
        (157, "setsid"),
        (158, "getgroups"),
        (159, "setgroups"),
        (160, "uname"),
        (161, "sethostname"),
        (162, "setdomainname"),
        (163, "getrlimit"),
        (164, "setrlimit"),
        (165, "getrusage"),
        (166, "umask"),
        (167, "prctl"),
        (168, "getcpu"),
        (169, "gettimeofday"),
        (170, "settimeofday"),
        (171, "adjtimex"),
        (172, "getpid"),
        (173, "getppid"),
        (174, "getuid"),
        (175, "geteuid"),
        (176, "getgid"),
        (177, "getegid"),
        (178, "gettid"),
        (179, "sysinfo"),
        (198, "socket"),
        (199, "socketpair"),
        (200, "bind"),
        (201, "listen"),
        (202, "accept"),
        (203, "connect"),
        (204, "getsockname"),
        (205, "getpeername"),
        (206, "sendto"),
        (207, "recvfrom"),
        (208, "setsockopt"),
        (209, "getsockopt"),
        (210, "shutdown"),
        (211, "sendmsg"),
        (212, "recvmsg"),
        (213, "readahead"),
        (214, "brk"),
        (215, "munmap"),
        (216, "mremap"),
        (217, "add_key"),
        (218, "request_key"),
        (219, "keyctl"),
        (220, "clone"),
        (221, "execve"),
        (222, "mmap"),
        (226, "mprotect"),
        (227, "msync"),
        (228, "mlock"),
        (229, "munlock"),
        (230, "mlockall"),
        (231, "munlockall"),
        (232, "mincore"),
        (233, "madvise"),
        (260, "wait4"),
        (261, "prlimit64"),
        (266, "clock_adjtime"),
        (267, "syncfs"),
        (268, "setns"),
        (269, "sendmmsg"),
        (276, "renameat2"),
        (277, "seccomp"),
        (278, "getrandom"),
        (279, "memfd_create"),
        (280, "bpf"),
        (281, "execveat"),
        (291, "statx"),
        (435, "clone3"),
        (436, "close_range"),
        (437, "openat2"),
        (439, "faccessat2"),
    ];
    lookup(TABLE, nr)
}

fn syscall_name_i386(nr: u32) -> Option<&'static str> {
    static TABLE: &[(u32, &str)] = &[
        (1, "exit"),
        (2, "fork"),
        (3, "read"),
        (4, "write"),
        (5, "open"),
        (6, "close"),
        (7, "waitpid"),
        (8, "creat"),
        (9, "link"),
        (10, "unlink"),
        (11, "execve"),
        (12, "chdir"),
        (13, "time"),
        (14, "mknod"),
        (15, "chmod"),
        (16, "lchown"),
        (19, "lseek"),
        (20, "getpid"),
        (21, "mount"),
        (23, "setuid"),
        (24, "getuid"),
        (26, "ptrace"),
        (33, "access"),
        (36, "sync"),
        (37, "kill"),
        (38, "rename"),
        (39, "mkdir"),
        (40, "rmdir"),
        (41, "dup"),
        (42, "pipe"),
        (45, "brk"),
        (46, "setgid"),
        (47, "getgid"),
        (49, "geteuid"),
        (50, "getegid"),
        (51, "acct"),
        (52, "umount2"),
        (54, "ioctl"),
        (55, "fcntl"),
        (57, "setpgid"),
        (60, "umask"),
        (61, "chroot"),
        (62, "ustat"),
        (63, "dup2"),
        (64, "getppid"),
        (65, "getpgrp"),
        (66, "setsid"),
        (83, "symlink"),
        (85, "readlink"),
        (88, "reboot"),
        (90, "mmap"),
        (91, "munmap"),
        (92, "truncate"),
        (93, "ftruncate"),
        (94, "fchmod"),
        (95, "fchown"),
        (96, "getpriority"),
        (97, "setpriority"),
        (99, "statfs"),
        (100, "fstatfs"),
        (102, "socketcall"),
        (103, "syslog"),
        (104, "setitimer"),
        (105, "getitimer"),
        (106, "stat"),
        (107, "lstat"),
        (108, "fstat"),
        (110, "iopl"),
        (111, "vhangup"),
        (114, "wait4"),
        (115, "swapoff"),
        (116, "sysinfo"),
        (118, "fsync"),
        (119, "sigreturn"),
        (120, "clone"),
        (121, "setdomainname"),
        (122, "uname"),
        (125, "mprotect"),
        (128, "init_module"),
        (129, "delete_module"),
        (132, "getpgid"),
        (133, "fchdir"),
        (140, "_llseek"),
        (141, "getdents"),
        (142, "_newselect"),
        (143, "flock"),
        (144, "msync"),
        (145, "readv"),
        (146, "writev"),
        (147, "getsid"),
        (148, "fdatasync"),
        (150, "mlock"),
        (151, "munlock"),
        (152, "mlockall"),
        (153, "munlockall"),
        (158, "sched_yield"),
        (162, "nanosleep"),
        (163, "mremap"),
        (168, "poll"),
        (172, "prctl"),
        (173, "rt_sigreturn"),
        (174, "rt_sigaction"),
        (175, "rt_sigprocmask"),
        (180, "pread64"),
        (181, "pwrite64"),
        (182, "chown"),
        (183, "getcwd"),
        (186, "sigaltstack"),
        (187, "sendfile"),
        (190, "vfork"),
        (191, "ugetrlimit"),
        (192, "mmap2"),
        (195, "stat64"),
        (196, "lstat64"),
        (197, "fstat64"),
        (217, "pivot_root"),
        (220, "getdents64"),
        (221, "fcntl64"),
        (224, "gettid"),
        (240, "futex"),
        (252, "exit_group"),
        (254, "epoll_create"),
        (255, "epoll_ctl"),
        (256, "epoll_wait"),
        (265, "clock_gettime"),
        (268, "statfs64"),
        (269, "fstatfs64"),
        (295, "openat"),
        (296, "mkdirat"),
        (297, "mknodat"),
        (298, "fchownat"),
        (300, "fstatat64"),
        (301, "unlinkat"),
        (302, "renameat"),
        (303, "linkat"),
        (304, "symlinkat"),
        (305, "readlinkat"),
        (306, "fchmodat"),
        (307, "faccessat"),
        (322, "openat2"),
        (331, "pipe2"),
        (355, "getrandom"),
        (358, "execveat"),
        (359, "socket"),
        (360, "socketpair"),
        (361, "bind"),
        (362, "connect"),
        (363, "listen"),
        (364, "accept4"),
        (365, "getsockopt"),
        (366, "setsockopt"),
        (367, "getsockname"),
        (368, "getpeername"),
        (369, "sendto"),
        (370, "sendmsg"),
        (371, "recvfrom"),
        (372, "recvmsg"),
        (373, "shutdown"),
        (383, "statx"),
    ];
    lookup(TABLE, nr)
}

fn lookup(table: &[(u32, &'static str)], nr: u32) -> Option<&'static str> {
    table
        .binary_search_by_key(&nr, |&(n, _)| n)
        .ok()
        .map(|idx| table[idx].1)
}
