//! End-to-end checks of the FTP client against a small scripted server.

use sorng_core::client::TransferClient;
use sorng_core::error::SyncErrorKind;
use sorng_ftp::ftp::{FtpClient, FtpConnectionConfig, FtpErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

struct FakeServer {
    port: u16,
    files: Files,
}

impl FakeServer {
    async fn start(password: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let files: Files = Arc::new(Mutex::new(HashMap::new()));
        let shared = files.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(serve(sock, shared.clone(), password));
            }
        });
        Self { port, files }
    }

    fn config(&self, password: &str) -> FtpConnectionConfig {
        FtpConnectionConfig {
            host: "127.0.0.1".into(),
            port: self.port,
            username: "alice".into(),
            password: password.into(),
            connect_timeout_sec: 5,
            data_timeout_sec: 5,
            ..Default::default()
        }
    }
}

async fn serve(sock: TcpStream, files: Files, password: &'static str) {
    let (rd, mut wr) = sock.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut data: Option<TcpListener> = None;
    let reply = |s: &str| format!("{}\r\n", s);

    wr.write_all(reply("220 fake ready").as_bytes()).await.unwrap();
    while let Ok(Some(line)) = lines.next_line().await {
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c.to_uppercase(), a.to_string()),
            None => (line.to_uppercase(), String::new()),
        };
        let out = match cmd.as_str() {
            "USER" => reply("331 password please"),
            "PASS" if arg == password => reply("230 logged in"),
            "PASS" => reply("530 Login incorrect."),
            "FEAT" => "211-Features:\r\n MLSD\r\n SIZE\r\n211 End\r\n".to_string(),
            "TYPE" | "NOOP" | "CWD" => reply("200 ok"),
            "PASV" => {
                let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let p = l.local_addr().unwrap().port();
                data = Some(l);
                reply(&format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256))
            }
            "MLSD" => {
                let body: String = files
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "type=file;size={};modify=20260101120000; {}\r\n",
                            v.len(),
                            k.trim_start_matches('/')
                        )
                    })
                    .collect();
                wr.write_all(reply("150 here it comes").as_bytes()).await.unwrap();
                let (mut ds, _) = data.take().unwrap().accept().await.unwrap();
                ds.write_all(body.as_bytes()).await.unwrap();
                drop(ds);
                reply("226 done")
            }
            "STOR" => {
                wr.write_all(reply("150 send it").as_bytes()).await.unwrap();
                let (mut ds, _) = data.take().unwrap().accept().await.unwrap();
                let mut buf = Vec::new();
                ds.read_to_end(&mut buf).await.unwrap();
                files.lock().unwrap().insert(arg.clone(), buf);
                reply("226 stored")
            }
            "RETR" => {
                let body = files.lock().unwrap().get(&arg).cloned();
                match body {
                    Some(body) => {
                        wr.write_all(reply("150 sending").as_bytes()).await.unwrap();
                        let (mut ds, _) = data.take().unwrap().accept().await.unwrap();
                        ds.write_all(&body).await.unwrap();
                        drop(ds);
                        reply("226 sent")
                    }
                    None => reply("550 No such file or directory"),
                }
            }
            "SIZE" => match files.lock().unwrap().get(&arg) {
                Some(v) => reply(&format!("213 {}", v.len())),
                None => reply("550 No such file or directory"),
            },
            "DELE" => match files.lock().unwrap().remove(&arg) {
                Some(_) => reply("250 deleted"),
                None => reply("550 No such file or directory"),
            },
            "RMD" => reply("550 No such file or directory"),
            "QUIT" => {
                let _ = wr.write_all(reply("221 bye").as_bytes()).await;
                return;
            }
            _ => reply("502 not implemented"),
        };
        if wr.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn upload_list_download_roundtrip() {
    let server = FakeServer::start("secret").await;
    let mut client = FtpClient::connect(server.config("secret")).await.unwrap();
    assert!(client.features.mlsd);

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("hello.txt");
    std::fs::write(&src, b"hello world").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress = move |done: u64, total: Option<u64>| sink.lock().unwrap().push((done, total));
    let n = client.upload_from(&src, "/hello.txt", &progress).await.unwrap();
    assert_eq!(n, 11);
    assert_eq!(seen.lock().unwrap().last(), Some(&(11, Some(11))));
    assert_eq!(
        server.files.lock().unwrap().get("/hello.txt").map(Vec::as_slice),
        Some(&b"hello world"[..])
    );

    let listing = TransferClient::list(&mut client, "/").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].path, "/hello.txt");
    assert_eq!(listing[0].size, 11);

    let dst = dir.path().join("nested/copy.txt");
    let got = client.download_to("/hello.txt", &dst, &|_, _| {}).await.unwrap();
    assert_eq!(got, 11);
    assert_eq!(std::fs::read(&dst).unwrap(), b"hello world");

    assert!(client.check_connection().await);
    client.close().await;
    assert!(TransferClient::is_closed(&client));
}

#[tokio::test]
async fn removing_a_missing_path_succeeds() {
    let server = FakeServer::start("secret").await;
    let mut client = FtpClient::connect(server.config("secret")).await.unwrap();
    client.remove("/nope.txt").await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn missing_remote_download_is_not_found() {
    let server = FakeServer::start("secret").await;
    let mut client = FtpClient::connect(server.config("secret")).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = client
        .download_to("/absent.bin", &dir.path().join("absent.bin"), &|_, _| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind, SyncErrorKind::NotFound);
    // A refused command leaves the session usable.
    assert!(client.check_connection().await);
}

#[tokio::test]
async fn wrong_password_is_an_auth_failure() {
    let server = FakeServer::start("secret").await;
    let err = FtpClient::connect(server.config("wrong")).await.err().unwrap();
    assert_eq!(err.kind, FtpErrorKind::AuthFailed);
}
