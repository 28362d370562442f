// OTA endpoints on the ESP HTTP server

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use embedded_svc::http::Method;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::io::{EspIOError, Read, Write};
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::ota::{ImageSource, OtaError, OtaService, PartitionTable, RecvError};
use crate::platform::EspOtaPlatform;
use crate::system::reset::{schedule_reset, EspRestart};

/// Request body as an image stream.
pub struct HttpBodySource<R> {
    body: R,
    content_len: usize,
}

impl<R: Read<Error = EspIOError>> HttpBodySource<R> {
    pub fn new(body: R, content_len: usize) -> Self {
        Self { body, content_len }
    }
}

impl<R: Read<Error = EspIOError>> ImageSource for HttpBodySource<R> {
    fn content_len(&self) -> usize {
        self.content_len
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        match self.body.read(buf) {
            Ok(0) => {
                // httpd reports a closed socket as an empty read plus errno
                let errno = std::io::Error::last_os_error();
                match errno.kind() {
                    ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
                        warn!("Connection closed, errno = {:?}", errno.raw_os_error());
                        Err(RecvError::Disconnected)
                    }
                    _ => Ok(0),
                }
            }
            Ok(n) => Ok(n),
            Err(e) => {
                warn!("httpd_req_recv failed: {:?}", e);
                Err(RecvError::Failed(e.0.code()))
            }
        }
    }
}

fn status_code(err: &OtaError) -> u16 {
    match err {
        OtaError::Framing { .. }
        | OtaError::MalformedHeader(_)
        | OtaError::DuplicateInvalidVersion(_)
        | OtaError::AlreadyRunning(_)
        | OtaError::ShortTransfer { .. }
        | OtaError::ImageCorrupted => 400,
        OtaError::UpdateInProgress => 409,
        _ => 500,
    }
}

pub struct OtaHttpServer {
    _server: EspHttpServer<'static>,
}

impl OtaHttpServer {
    pub fn start(service: Arc<OtaService<EspOtaPlatform>>, reset_delay: Duration) -> Result<Self> {
        let mut server = EspHttpServer::new(&Configuration {
            stack_size: 10240,
            ..Default::default()
        })?;

        let ota_service = service.clone();
        server.fn_handler("/ota", Method::Post, move |mut req| {
            let Some(content_len) = req.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) else {
                let mut response = req.into_status_response(411)?;
                response.write_all(br#"{"error":"Missing Content-Length"}"#)?;
                return Ok::<(), anyhow::Error>(());
            };

            let mut body = Map::new();
            let result = {
                let mut source = HttpBodySource::new(&mut req, content_len);
                ota_service.handle_update(&mut source, &mut body)
            };
            let status = match &result {
                Ok(_) => 200,
                Err(e) => status_code(e),
            };

            let json = serde_json::to_vec(&Value::Object(body))?;
            let mut response = req.into_response(status, None, &[("Content-Type", "application/json")])?;
            response.write_all(&json)?;
            Ok(())
        })?;

        let status_service = service.clone();
        server.fn_handler("/ota/status", Method::Get, move |req| {
            let status = status_service.with_platform(|platform| {
                let running = platform.running();
                json!({
                    "running": running.label.as_str(),
                    "offset": running.offset,
                    "version": platform.description(&running).map(|d| d.version().to_string()),
                    "boot": platform.configured_boot().label.as_str(),
                    "last_invalid": platform.last_invalid().and_then(|p| platform.description(&p))
                        .map(|d| d.version().to_string()),
                })
            });
            let mut response = req.into_response(200, None, &[("Content-Type", "application/json")])?;
            response.write_all(status.to_string().as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        server.fn_handler("/reset", Method::Post, move |req| {
            let mut response = req.into_ok_response()?;
            response.write_all(br#"{"status":"restarting"}"#)?;
            info!("Reset requested, restarting in {:?}", reset_delay);
            schedule_reset(EspRestart, reset_delay);
            Ok::<(), anyhow::Error>(())
        })?;

        info!("OTA endpoints ready: POST /ota, GET /ota/status, POST /reset");
        Ok(Self { _server: server })
    }
}
