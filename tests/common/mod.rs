#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use flate2::{Compression, write::GzEncoder};
use serverkeep::{
    InstanceId, LifecycleState, ManagedInstance,
    config::SupervisorSettings,
    instance::{LaunchSpec, RconEndpoint},
    rcon::Packet,
};
use tokio::{
    io::{AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};

/// Prints a ready line, answers `list`, exits cleanly on `stop`.
pub const POLITE_SERVER: &str = r#"echo "[12:00:00] [Server thread/INFO]: Starting minecraft server version 1.20.4"
echo '[12:00:01] [Server thread/INFO]: Done (1.234s)! For help, type "help"'
while read line; do
  case "$line" in
    stop) echo "[12:00:09] [Server thread/INFO]: Stopping server"; exit 0 ;;
    list) echo "[12:00:05] [Server thread/INFO]: There are 1 of a max of 20 players online: Steve" ;;
    join) echo "[12:00:05] [Server thread/INFO]: Steve joined the game" ;;
    *) echo "[12:00:05] [Server thread/INFO]: Unknown command: $line" ;;
  esac
done
"#;

/// Becomes ready, then ignores every command including `stop`.
pub const STUBBORN_SERVER: &str = r#"echo '[12:00:01] [Server thread/INFO]: Done (0.5s)! For help, type "help"'
while read line; do :; done
"#;

/// Becomes ready and dies with a non-zero code.
pub const CRASHING_SERVER: &str = r#"echo '[12:00:01] [Server thread/INFO]: Done (0.5s)! For help, type "help"'
exit 1
"#;

/// Reports a tick-loop crash but exits with code 0.
pub const CRASH_REPORT_SERVER: &str = r#"echo '[12:00:01] [Server thread/INFO]: Done (0.5s)! For help, type "help"'
echo "[12:00:02] [Server thread/ERROR]: Exception in server tick loop"
exit 0
"#;

/// Becomes ready, then never reads its input again.
pub const DEAF_SERVER: &str = r#"echo '[12:00:01] [Server thread/INFO]: Done (0.5s)! For help, type "help"'
exec sleep 1000
"#;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_supervisor() -> SupervisorSettings {
    SupervisorSettings {
        grace_secs: 5,
        restart_settle_ms: 50,
        stop_command: "stop".to_string(),
        kill_wait_secs: 5,
        command_timeout_ms: 500,
    }
}

/// A shell-script instance rooted at `dir`.
pub fn script_instance(dir: &Path, id: &str, script: &str) -> ManagedInstance {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("server.sh"), script).unwrap();
    ManagedInstance {
        id: InstanceId::new(id),
        name: id.to_string(),
        working_dir: dir.to_path_buf(),
        launch: LaunchSpec::Executable {
            program: PathBuf::from("/bin/sh"),
            args: vec!["server.sh".to_string()],
        },
        memory_mb: None,
        max_players: Some(20),
        rcon: None,
    }
}

pub fn rcon_instance(dir: &Path, id: &str, addr: SocketAddr, password: &str) -> ManagedInstance {
    let mut instance = script_instance(dir, id, POLITE_SERVER);
    instance.rcon = Some(RconEndpoint {
        host: addr.ip().to_string(),
        port: addr.port(),
        password: password.to_string(),
    });
    instance
}

pub async fn wait_for_state(
    mut rx: watch::Receiver<LifecycleState>,
    wanted: LifecycleState,
) -> LifecycleState {
    let state = timeout(WAIT, rx.wait_for(|state| *state == wanted))
        .await
        .expect("state change in time")
        .expect("state channel open");
    *state
}

/// Polls `check` until it holds or [`WAIT`] passes.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Minimal RCON server: password `secret`, echoes commands, sends a decoy
/// packet with a foreign id before each real response, never answers `hang`,
/// drops the connection on `quit`, and dribbles the reply to `slow`.
pub async fn spawn_rcon_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(serve_rcon(socket));
        }
    });

    (addr, connections)
}

async fn serve_rcon(socket: TcpStream) {
    let mut stream = BufStream::new(socket);

    let Ok(auth) = Packet::read_from(&mut stream).await else {
        return;
    };
    // Vanilla servers send an empty response value before the auth result.
    let _ = Packet::new(auth.id, Packet::RESPONSE_VALUE, "")
        .write_to(&mut stream)
        .await;
    if auth.body != "secret" {
        let _ = Packet::new(Packet::AUTH_FAILED_ID, Packet::AUTH_RESPONSE, "")
            .write_to(&mut stream)
            .await;
        return;
    }
    if Packet::new(auth.id, Packet::AUTH_RESPONSE, "")
        .write_to(&mut stream)
        .await
        .is_err()
    {
        return;
    }

    while let Ok(request) = Packet::read_from(&mut stream).await {
        match request.body.as_str() {
            "hang" => continue,
            "quit" => return,
            "slow" => {
                let frame =
                    Packet::new(request.id, Packet::RESPONSE_VALUE, "echo: slow").encode();
                let (head, tail) = frame.split_at(6);
                if stream.write_all(head).await.is_err() || stream.flush().await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                if stream.write_all(tail).await.is_err() || stream.flush().await.is_err() {
                    return;
                }
            }
            body => {
                let decoy = Packet::new(request.id + 100, Packet::RESPONSE_VALUE, "decoy");
                let reply = Packet::new(request.id, Packet::RESPONSE_VALUE, format!("echo: {body}"));
                if decoy.write_to(&mut stream).await.is_err()
                    || reply.write_to(&mut stream).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Relative path and contents of every regular file under `root`, sorted.
pub fn tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.push((rel, std::fs::read(&path).unwrap()));
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Writes a small world-like tree under `root`.
pub fn populate(root: &Path) {
    std::fs::create_dir_all(root.join("world/region")).unwrap();
    std::fs::create_dir_all(root.join("plugins/config")).unwrap();
    std::fs::write(root.join("server.properties"), "motd=hello\nmax-players=20\n").unwrap();
    std::fs::write(root.join("world/level.dat"), [0u8, 1, 2, 3, 255, 254]).unwrap();
    std::fs::write(root.join("world/region/r.0.0.mca"), vec![7u8; 64 * 1024]).unwrap();
    std::fs::write(root.join("plugins/config/settings.yml"), "enabled: true\n").unwrap();
}

/// Writes `count` files of `size` bytes of poorly compressible data under `root`.
pub fn noisy_tree(root: &Path, count: usize, size: usize) {
    std::fs::create_dir_all(root).unwrap();
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for i in 0..count {
        let data: Vec<u8> = (0..size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        std::fs::write(root.join(format!("chunk-{i:04}.bin")), data).unwrap();
    }
}

/// Writes a gzip'd tar that passes inspection but cannot be extracted: a
/// regular file `world` followed by `world/level.dat`.
pub fn conflicting_archive(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let entries: [(&str, &[u8]); 3] = [
        ("server.properties", b"motd=restored\n"),
        ("world", b"flat"),
        ("world/level.dat", b"level"),
    ];
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Writes a gzip'd tar holding a single entry whose raw name is `name`.
pub fn hostile_archive(path: &Path, name: &str) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let data = b"pwned";
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    let raw = &mut header.as_gnu_mut().unwrap().name;
    raw[..name.len()].copy_from_slice(name.as_bytes());
    header.set_cksum();

    builder.append(&header, &data[..]).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}
