use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use indicatif::MultiProgress;
use log::{debug, info};

pub const USER_AGENT_HEADER: &str = "github.com/winecharm/winecharm";

const CHUNK: usize = 4096;

pub type TlsError = native_tls::Error;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("TLS error. {0}")]
    Tls(#[from] &'static TlsError),
    #[error("HTTP error. {0}")]
    Http(#[from] Box<ureq::Error>),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Download cancelled")]
    Cancelled,
}

/// Process-wide progress area. Loggers and bars both draw through it.
pub fn mp() -> &'static MultiProgress {
    static MP: OnceLock<MultiProgress> = OnceLock::new();
    MP.get_or_init(MultiProgress::new)
}

/// Shared agent using the system TLS implementation.
pub fn ureq() -> Result<&'static ureq::Agent, &'static TlsError> {
    static AGENT: OnceLock<Result<ureq::Agent, TlsError>> = OnceLock::new();
    AGENT
        .get_or_init(|| {
            let tls = native_tls::TlsConnector::new()?;
            Ok(ureq::AgentBuilder::new()
                .tls_connector(Arc::new(tls))
                .user_agent(USER_AGENT_HEADER)
                .build())
        })
        .as_ref()
}

pub fn download_file(url: &str) -> Result<DownloadStream<impl Read>, Error> {
    info!("Downloading {url}");
    let response = ureq()?.get(url).call().map_err(Box::new)?;

    let len = response
        .header("Content-Length")
        .and_then(|h| h.parse::<usize>().ok());

    let body = response.into_reader();

    Ok(DownloadStream { body, len })
}

pub struct DownloadStream<R: Read> {
    pub body: R,
    pub len: Option<usize>,
}

impl<R: Read> DownloadStream<R> {
    /// Streams the body into `dest` in 4 KiB chunks, reporting the downloaded fraction
    /// when the length is known. The partial file is removed when `stop` is raised or
    /// anything fails.
    pub fn save_to(
        mut self,
        dest: &Path,
        stop: &AtomicBool,
        mut on_fraction: impl FnMut(f64),
    ) -> Result<u64, Error> {
        let result = (|| -> Result<u64, Error> {
            let mut file = File::create(dest)?;
            let mut buf = [0u8; CHUNK];
            let mut written = 0u64;

            loop {
                if stop.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }

                let read = self.body.read(&mut buf)?;
                if read == 0 {
                    break;
                }

                file.write_all(&buf[..read])?;
                written += read as u64;

                if let Some(len) = self.len.filter(|&l| l > 0) {
                    #[allow(clippy::cast_precision_loss)]
                    on_fraction((written as f64 / len as f64).min(1.0));
                }
            }

            file.flush()?;
            Ok(written)
        })();

        if result.is_err() {
            debug!("Removing partial download {}", dest.display());
            let _ = fs::remove_file(dest);
        }

        result
    }
}
