//! Mock peers and request parsing for the trade-flow tests.
#![allow(dead_code)] // each test binary uses a different subset
//!
//! `MockCoordinator` serves the transaction document and advances it on
//! signed buyer messages; `MockSeller` implements the worker HTTP
//! surface: capability probe, linear upload, wishlist exchange, chunk
//! data, assist tickets and the receipt. Both run `tiny_http` servers on
//! ephemeral ports driven from plain threads.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tiny_http::{Header, Method, Response, Server};
use umber_cafs::Store;
use umber_crypto::identity::Identity;
use umber_crypto::ofb;
use umber_sync::{codec, SyncInfo, Wishlist};
use umber_trade::assist::TicketRegistry;
use umber_trade::coordinator::CoordinatorClient;
use umber_trade::{TradeConfig, TradeContext};
use umber_types::{Fingerprint, Tx, TxPhase, TxState};

// ---------------------------------------------------------------------------
// Context plumbing
// ---------------------------------------------------------------------------

/// Build a trade context talking to the given coordinator URL, with fast
/// polling suitable for tests.
pub fn test_context(coordinator_url: &str, store: Store) -> TradeContext {
    let config = TradeConfig {
        coordinator_url: coordinator_url.to_string(),
        poll_interval_ms: 50,
        poll_max_failures: 8,
        request_timeout_ms: 5000,
        max_transmissions: 2,
    };
    let identity = Arc::new(Identity::generate());
    let coordinator =
        Arc::new(CoordinatorClient::new(&config, identity.clone()).expect("coordinator client"));
    TradeContext {
        store,
        coordinator,
        identity,
        tickets: TicketRegistry::new(),
        admission: Arc::new(tokio::sync::Semaphore::new(config.max_transmissions)),
        config,
    }
}

/// Poll `pred` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pred()
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// One decoded part of a multipart body.
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Decode a `multipart/form-data` body.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Vec<Part> {
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .expect("boundary parameter")
        .trim()
        .to_string();
    let delimiter = format!("--{boundary}");

    let mut parts = Vec::new();
    let Some(start) = find(body, delimiter.as_bytes()) else {
        return parts;
    };
    let mut rest = &body[start + delimiter.len()..];
    loop {
        if rest.starts_with(b"--") {
            break;
        }
        if rest.starts_with(b"\r\n") {
            rest = &rest[2..];
        }
        let Some(header_end) = find(rest, b"\r\n\r\n") else {
            break;
        };
        let headers = String::from_utf8_lossy(&rest[..header_end]).to_string();
        let after = &rest[header_end + 4..];
        let Some(next) = find(after, delimiter.as_bytes()) else {
            break;
        };
        let data = after[..next].strip_suffix(b"\r\n").unwrap_or(&after[..next]);
        rest = &after[next + delimiter.len()..];

        parts.push(Part {
            name: header_param(&headers, "name=\"").unwrap_or_default(),
            filename: header_param(&headers, "filename=\""),
            data: data.to_vec(),
        });
    }
    parts
}

/// Decode an `application/x-www-form-urlencoded` body of plain values.
pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn header_param(headers: &str, prefix: &str) -> Option<String> {
    let idx = headers.find(prefix)?;
    let rest = &headers[idx + prefix.len()..];
    Some(rest[..rest.find('"')?].to_string())
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("gzip body");
    out
}

// ---------------------------------------------------------------------------
// Mock coordinator
// ---------------------------------------------------------------------------

/// Server-side transaction record.
pub struct TxDoc {
    pub state: TxState,
    pub phase: TxPhase,
    pub worker_url: String,
    pub seller: String,
    pub result_decryption_key: Option<Fingerprint>,
    /// Phase installed when the buyer's establish message arrives.
    pub establish_phase: TxPhase,
    pub establishes: u32,
    pub accepts: u32,
    /// Form fields of the last establish message.
    pub last_establish: Option<HashMap<String, String>>,
}

impl TxDoc {
    pub fn new(worker_url: &str) -> Self {
        Self {
            state: TxState::Active,
            phase: TxPhase::SellerEstablished,
            worker_url: worker_url.to_string(),
            seller: "seller-7".to_string(),
            result_decryption_key: None,
            establish_phase: TxPhase::Transmitting,
            establishes: 0,
            accepts: 0,
            last_establish: None,
        }
    }

    fn to_tx(&self) -> Tx {
        Tx {
            state: self.state,
            phase: self.phase,
            worker_url: Some(self.worker_url.clone()),
            seller: self.seller.clone(),
            result_decryption_key: self.result_decryption_key,
        }
    }
}

/// In-process coordinator: `GET /tx/{id}` serves the document, signed
/// `POST /tx/{id}` messages advance it.
pub struct MockCoordinator {
    pub url: String,
    pub doc: Arc<Mutex<TxDoc>>,
}

impl MockCoordinator {
    pub fn spawn(tx_id: &str, doc: Arc<Mutex<TxDoc>>) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind coordinator");
        let url = format!("http://{}", server.server_addr());
        let state = doc.clone();
        let path = format!("/tx/{tx_id}");

        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                if request.url() != path {
                    let _ = request.respond(Response::empty(404));
                    continue;
                }
                match request.method() {
                    Method::Get => {
                        let json = {
                            let doc = state.lock().unwrap();
                            serde_json::to_string(&doc.to_tx()).expect("serialize tx")
                        };
                        let _ = request.respond(Response::from_string(json));
                    }
                    Method::Post => {
                        let mut body = String::new();
                        let _ = request.as_reader().read_to_string(&mut body);
                        let form = parse_form(&body);
                        {
                            let mut doc = state.lock().unwrap();
                            if form.contains_key("workhash") {
                                doc.establishes += 1;
                                doc.phase = doc.establish_phase;
                                doc.last_establish = Some(form);
                            } else {
                                doc.accepts += 1;
                                doc.state = TxState::Retired;
                            }
                        }
                        let _ = request.respond(Response::empty(200));
                    }
                    _ => {
                        let _ = request.respond(Response::empty(404));
                    }
                }
            }
        });

        Self { url, doc }
    }

    pub fn establishes(&self) -> u32 {
        self.doc.lock().unwrap().establishes
    }

    pub fn accepts(&self) -> u32 {
        self.doc.lock().unwrap().accepts
    }
}

// ---------------------------------------------------------------------------
// Mock seller
// ---------------------------------------------------------------------------

/// What the mock seller observed, in arrival order.
#[derive(Debug, Clone)]
pub enum SellerEvent {
    Options,
    LinearWork {
        work: Vec<u8>,
        buyer_secret: String,
    },
    WishlistRequest {
        info: SyncInfo,
        gzipped: bool,
        legacy: bool,
    },
    ChunkData {
        indices: Vec<usize>,
        gzipped: bool,
    },
    AssistTicket(String),
    Receipt {
        enc_hash: String,
        signature: String,
    },
}

/// Which chunks the seller claims to be missing.
pub enum WishlistMode {
    /// Request every chunk.
    All,
    /// Request every chunk except one.
    Skip(usize),
}

pub struct SellerConfig {
    /// JSON answer to the `OPTIONS` probe; `None` answers 404.
    pub caps: Option<&'static str>,
    pub wishlist: WishlistMode,
    /// Tickets offered in the wishlist response header.
    pub assist_offers: Vec<String>,
    /// Slow down reads of large uploads (for interrupt tests).
    pub throttle_uploads: bool,
}

impl Default for SellerConfig {
    fn default() -> Self {
        Self {
            caps: None,
            wishlist: WishlistMode::All,
            assist_offers: Vec::new(),
            throttle_uploads: false,
        }
    }
}

/// In-process seller worker speaking the buyer-facing HTTP surface.
pub struct MockSeller {
    pub url: String,
    pub events: Arc<Mutex<Vec<SellerEvent>>>,
    /// One-time key the encrypted result is encrypted under.
    pub enc_key: Fingerprint,
    /// Plaintext of the result the seller pretends to compute.
    pub plaintext: Vec<u8>,
}

impl MockSeller {
    pub fn spawn(config: SellerConfig, plaintext: &[u8], doc: Arc<Mutex<TxDoc>>) -> Self {
        let server = Server::http("127.0.0.1:0").expect("bind seller");
        let url = format!("http://{}", server.server_addr());
        let enc_key = Fingerprint::from_bytes(rand::random());
        let events: Arc<Mutex<Vec<SellerEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let mut ciphertext = plaintext.to_vec();
        ofb::apply_in_place(&enc_key, &mut ciphertext);

        let worker = SellerWorker {
            config,
            doc,
            enc_key,
            ciphertext,
            events: events.clone(),
            info: None,
            wishlist: None,
        };
        thread::spawn(move || worker.run(server));

        Self {
            url,
            events,
            enc_key,
            plaintext: plaintext.to_vec(),
        }
    }

    pub fn events(&self) -> Vec<SellerEvent> {
        self.events.lock().unwrap().clone()
    }
}

struct SellerWorker {
    config: SellerConfig,
    doc: Arc<Mutex<TxDoc>>,
    enc_key: Fingerprint,
    ciphertext: Vec<u8>,
    events: Arc<Mutex<Vec<SellerEvent>>>,
    info: Option<SyncInfo>,
    wishlist: Option<Wishlist>,
}

impl SellerWorker {
    fn run(mut self, server: Server) {
        for request in server.incoming_requests() {
            self.handle(request);
        }
    }

    fn record(&self, event: SellerEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn handle(&mut self, mut request: tiny_http::Request) {
        let method = request.method().clone();
        let content_type = header_value(&request, "Content-Type");
        let gzipped = header_value(&request, "Content-Encoding")
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);

        if method == Method::Options {
            self.record(SellerEvent::Options);
            let response = match self.config.caps {
                Some(json) => Response::from_string(json).with_status_code(200),
                None => Response::from_string("").with_status_code(404),
            };
            let _ = request.respond(response);
            return;
        }
        if method != Method::Post {
            let _ = request.respond(Response::empty(404));
            return;
        }

        let mut body = Vec::new();
        if self.config.throttle_uploads {
            // Trickle-read so an interrupt lands mid-upload.
            let reader = request.as_reader();
            let mut buf = [0u8; 16 * 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        body.extend_from_slice(&buf[..n]);
                        thread::sleep(Duration::from_millis(30));
                    }
                    Err(_) => return, // buyer hung up
                }
            }
        } else if request.as_reader().read_to_end(&mut body).is_err() {
            return;
        }
        if gzipped {
            body = gunzip(&body);
        }

        let content_type = content_type.unwrap_or_default();
        if content_type.starts_with("multipart/form-data") {
            self.handle_multipart(request, &content_type, &body, gzipped);
        } else {
            self.handle_receipt(request, &body);
        }
    }

    fn handle_multipart(
        &mut self,
        request: tiny_http::Request,
        content_type: &str,
        body: &[u8],
        gzipped: bool,
    ) {
        let parts = parse_multipart(content_type, body);
        let part = |name: &str| parts.iter().find(|p| p.name == name);

        if let Some(work) = part("work") {
            let secret = part("buyersecret")
                .map(|p| String::from_utf8_lossy(&p.data).into_owned())
                .unwrap_or_default();
            self.record(SellerEvent::LinearWork {
                work: work.data.clone(),
                buyer_secret: secret,
            });
            let _ = request.respond(Response::from_data(self.ciphertext.clone()));
        } else if let Some(header_part) = part("a32chunks").or_else(|| part("syncinfojson")) {
            let legacy = header_part.name == "a32chunks";
            let info = if legacy {
                SyncInfo::read_legacy(&mut header_part.data.as_slice()).expect("legacy header")
            } else {
                serde_json::from_slice(&header_part.data).expect("sync info json")
            };

            let bits: Vec<bool> = (0..info.num_chunks())
                .map(|i| match self.config.wishlist {
                    WishlistMode::All => true,
                    WishlistMode::Skip(skip) => i != skip,
                })
                .collect();
            let wishlist = Wishlist::from_bits(bits);

            self.record(SellerEvent::WishlistRequest {
                info: info.clone(),
                gzipped,
                legacy,
            });

            let mut response = Response::from_data(wishlist.to_bytes());
            if !self.config.assist_offers.is_empty() {
                let offers = serde_json::to_string(&self.config.assist_offers).expect("offers");
                response = response.with_header(
                    Header::from_bytes(&b"X-Bitwrk-Assist"[..], offers.as_bytes())
                        .expect("assist header"),
                );
            }
            self.info = Some(info);
            self.wishlist = Some(wishlist);
            let _ = request.respond(response);
        } else if let Some(chunkdata) = part("chunkdata") {
            let info = self.info.as_ref().expect("sync info before chunk data");
            let wishlist = self.wishlist.as_ref().expect("wishlist before chunk data");
            let received = codec::read_chunk_data(info, wishlist, &mut chunkdata.data.as_slice())
                .expect("chunk data stream");
            self.record(SellerEvent::ChunkData {
                indices: received.iter().map(|(i, _)| *i).collect(),
                gzipped,
            });
            let _ = request.respond(Response::from_data(self.ciphertext.clone()));
        } else if let Some(ticket) = part("assisturl") {
            self.record(SellerEvent::AssistTicket(
                String::from_utf8_lossy(&ticket.data).into_owned(),
            ));
            let _ = request.respond(Response::empty(200));
        } else {
            let _ = request.respond(Response::empty(400));
        }
    }

    fn handle_receipt(&mut self, request: tiny_http::Request, body: &[u8]) {
        let form = parse_form(&String::from_utf8_lossy(body));
        let (Some(enc_hash), Some(signature)) =
            (form.get("encresulthash"), form.get("encresulthashsig"))
        else {
            let _ = request.respond(Response::empty(400));
            return;
        };
        self.record(SellerEvent::Receipt {
            enc_hash: enc_hash.clone(),
            signature: signature.clone(),
        });

        // The receipt redeems the decryption key at the coordinator.
        {
            let mut doc = self.doc.lock().unwrap();
            doc.phase = TxPhase::Unverified;
            doc.result_decryption_key = Some(self.enc_key);
        }
        let _ = request.respond(Response::empty(200));
    }
}

fn header_value(request: &tiny_http::Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_string())
}
