use std::path::{Path, PathBuf};

/// Returns the runtime data directory for fanout, preferring memory-backed
/// filesystems so limiter sockets never touch a disk. Falls back through the
/// system temp dir and `/tmp` to the user's home directory.
pub fn data_dir() -> PathBuf {
    let base = if Path::new("/dev/shm").exists() {
        PathBuf::from("/dev/shm")
    } else if std::env::temp_dir().exists() {
        std::env::temp_dir()
    } else if Path::new("/tmp").exists() {
        PathBuf::from("/tmp")
    } else {
        std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
    };

    match username() {
        Some(user) if !user.is_empty() => base.join(format!(".fanout-{user}")),
        _ => base.join(".fanout"),
    }
}

/// Path of the concurrency-limiter socket owned by the process with `pid`.
pub fn limit_socket_path(pid: u32) -> PathBuf {
    data_dir().join(pid.to_string()).join("processlimit")
}

fn username() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map(|user| user.name)
}
