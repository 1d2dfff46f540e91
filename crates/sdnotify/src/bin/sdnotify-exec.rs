//! `sdnotify-exec` — notify-protocol proxy. Execs a child process with a
//! private `$NOTIFY_SOCKET` of its own, then forwards every datagram the
//! child sends onward to whatever notify socket this process itself
//! inherited (spec.md §6).
//!
//! Useful for wrapping a child that doesn't itself run as Chaperone's
//! `notify`-type service entry point (e.g. a shell script that execs the
//! real daemon several layers down) — the wrapper collects the real
//! daemon's READY=1 and re-emits it up the chain as if it had sent it
//! directly.

use std::os::unix::net::UnixDatagram;
use std::os::unix::process::CommandExt;
use std::process::Command;

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(program) = args.next() else {
        eprintln!("usage: sdnotify-exec <command> [args...]");
        std::process::exit(1);
    };
    let rest: Vec<String> = args.collect();

    let upstream = std::env::var("NOTIFY_SOCKET").ok();

    let proxy_dir = std::env::temp_dir();
    let proxy_path = proxy_dir.join(format!("sdnotify-exec.{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&proxy_path);
    let proxy = match UnixDatagram::bind(&proxy_path) {
        Ok(sock) => sock,
        Err(e) => {
            eprintln!("sdnotify-exec: failed to bind proxy socket: {e}");
            std::process::exit(1);
        }
    };

    if let Some(upstream) = upstream.clone() {
        std::thread::spawn(move || forward_loop(proxy, &upstream));
    }

    let mut command = Command::new(&program);
    command.args(&rest);
    command.env("NOTIFY_SOCKET", &proxy_path);
    // SAFETY: exec replaces this process image entirely; nothing after
    // this point runs in the parent, so the forwarding thread above only
    // matters if exec fails.
    let err = unsafe { command.exec() };
    eprintln!("sdnotify-exec: failed to exec {program}: {err}");
    let _ = std::fs::remove_file(&proxy_path);
    std::process::exit(1);
}

fn forward_loop(proxy: UnixDatagram, upstream: &str) {
    let mut buf = [0u8; 4096];
    loop {
        let Ok(n) = proxy.recv(&mut buf) else { return };
        if let Some(stripped) = upstream.strip_prefix('@') {
            forward_abstract(&buf[..n], stripped);
        } else if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(&buf[..n], upstream);
        }
    }
}

fn forward_abstract(payload: &[u8], name: &str) {
    let Ok(sock) = UnixDatagram::unbound() else { return };
    use std::os::unix::io::AsRawFd;
    let fd = sock.as_raw_fd();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let name_bytes = name.as_bytes();
    let max_len = addr.sun_path.len() - 1;
    if name_bytes.len() > max_len {
        return;
    }
    for (i, &b) in name_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = b as libc::c_char;
    }
    let addr_len = std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len();
    unsafe {
        libc::sendto(
            fd,
            payload.as_ptr().cast(),
            payload.len(),
            libc::MSG_NOSIGNAL,
            (&addr as *const libc::sockaddr_un).cast(),
            addr_len as libc::socklen_t,
        );
    }
}
