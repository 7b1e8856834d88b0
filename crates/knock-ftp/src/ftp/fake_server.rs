//! Scripted in-process FTP server for tests.
//!
//! Password `raspberry` is accepted. `RETR hang` never answers and
//! `RETR drop` closes the control connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Default)]
struct Shared {
    uploaded: Mutex<Vec<u8>>,
    logins: AtomicUsize,
}

pub struct FakeFtpServer {
    pub port: u16,
    shared: Arc<Shared>,
}

const LISTING: &str = "type=file;size=11;modify=20260101120000; visitor.jpg\r\n\
                       type=dir;modify=20260101120000; archive\r\n";

impl FakeFtpServer {
    pub const FILE_BODY: &'static [u8] = b"\xff\xd8jpegbytes";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());
        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream, accept_shared.clone()));
            }
        });
        Self { port, shared }
    }

    pub async fn uploaded(&self) -> Vec<u8> {
        self.shared.uploaded.lock().await.clone()
    }

    pub fn logins(&self) -> usize {
        self.shared.logins.load(Ordering::SeqCst)
    }
}

async fn reply(wr: &mut OwnedWriteHalf, text: &str) {
    let _ = wr.write_all(format!("{}\r\n", text).as_bytes()).await;
}

async fn handle(stream: TcpStream, shared: Arc<Shared>) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut pasv: Option<TcpListener> = None;
    reply(&mut wr, "220 fake doorbell ftp").await;

    while let Ok(Some(line)) = lines.next_line().await {
        let (cmd, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match cmd.to_uppercase().as_str() {
            "USER" => reply(&mut wr, "331 Password required").await,
            "PASS" if arg == "raspberry" => {
                shared.logins.fetch_add(1, Ordering::SeqCst);
                reply(&mut wr, "230 Logged in").await
            }
            "PASS" => reply(&mut wr, "530 Login incorrect").await,
            "FEAT" => reply(&mut wr, "211-Features:\r\n MLSD\r\n SIZE\r\n UTF8\r\n211 End").await,
            "OPTS" | "TYPE" | "NOOP" => reply(&mut wr, "200 OK").await,
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let p = listener.local_addr().unwrap().port();
                pasv = Some(listener);
                reply(&mut wr, &format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256)).await
            }
            "MLSD" | "LIST" => send_data(&mut wr, pasv.take(), LISTING.as_bytes()).await,
            "RETR" if arg == "hang" => std::future::pending::<()>().await,
            "RETR" if arg == "drop" => return,
            "RETR" => send_data(&mut wr, pasv.take(), FakeFtpServer::FILE_BODY).await,
            "STOR" => {
                reply(&mut wr, "150 Ok to send data").await;
                if let Some(listener) = pasv.take() {
                    let (mut data, _) = listener.accept().await.unwrap();
                    let mut buf = Vec::new();
                    data.read_to_end(&mut buf).await.unwrap();
                    *shared.uploaded.lock().await = buf;
                }
                reply(&mut wr, "226 Transfer complete").await
            }
            "SIZE" => reply(&mut wr, &format!("213 {}", FakeFtpServer::FILE_BODY.len())).await,
            "DELE" | "RMD" if arg.starts_with("missing") => {
                reply(&mut wr, "550 No such file or directory").await
            }
            "DELE" | "RMD" | "RNTO" => reply(&mut wr, "250 OK").await,
            "MKD" => reply(&mut wr, &format!("257 \"{}\" created", arg)).await,
            "RNFR" => reply(&mut wr, "350 Ready for RNTO").await,
            "QUIT" => {
                reply(&mut wr, "221 Goodbye").await;
                return;
            }
            _ => reply(&mut wr, "502 Command not implemented").await,
        }
    }
}

async fn send_data(wr: &mut OwnedWriteHalf, listener: Option<TcpListener>, body: &[u8]) {
    let Some(listener) = listener else {
        reply(wr, "425 Use PASV first").await;
        return;
    };
    reply(wr, "150 Opening data connection").await;
    let (mut data, _) = listener.accept().await.unwrap();
    data.write_all(body).await.unwrap();
    drop(data);
    reply(wr, "226 Transfer complete").await;
}
