//! The work-transfer sub-protocol against the seller's worker.
//!
//! Entered once the transaction reaches the transmitting phase. The
//! seller is probed for capabilities via `OPTIONS`; depending on the
//! answer the work travels either as one linear multipart upload or as
//! a chunked synchronization: a sync-info header buys a wishlist of
//! missing chunks, whose bodies are then streamed in permuted order.
//! Either way the response body of the final POST is the encrypted
//! result, which gets captured into the store and receipted.
//!
//! All connections opened here live inside one [`ScopedClient`] guarded
//! by a watchdog; when the transaction leaves the legal phase window,
//! every in-flight stream dies with the scope.

use std::io;
use std::sync::Arc;

use reqwest::{header, Method, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use umber_cafs::File;
use umber_crypto::secret::Secret;
use umber_sync::{codec, SyncInfo, Wishlist};
use umber_types::{TxPhase, TxState, WorkerCaps, MAX_WORK_FILE_CHUNKS};

use crate::activity::{ActivityState, StateCell};
use crate::assist::{TicketRegistry, ASSIST_TICKET_HEADER};
use crate::coordinator::{TxTracker, TxView};
use crate::gzip::Compressor;
use crate::multipart::MultipartWriter;
use crate::pipe;
use crate::scope::ScopedClient;
use crate::{watchdog, Result, TradeContext, TradeError};

/// Everything the transfer needs from the driving buy.
pub(crate) struct TransferEnv {
    pub ctx: TradeContext,
    pub shared: Arc<StateCell<ActivityState>>,
    pub tx_id: String,
    pub secret: Secret,
    pub tracker: Arc<TxTracker>,
}

/// Run the complete buyer-to-seller contact: probe, transmit work,
/// capture the encrypted result, sign the receipt.
pub(crate) async fn interact_with_seller(env: &TransferEnv, work: &File) -> Result<()> {
    let view = env.tracker.snapshot();
    let tx = view
        .tx
        .as_ref()
        .ok_or_else(|| TradeError::Coordinator("no transaction snapshot".to_string()))?;
    let worker_url = tx.worker_url.clone().ok_or_else(|| {
        TradeError::SellerProtocol("seller published no worker endpoint".to_string())
    })?;
    let seller_node = seller_node_id(&tx.seller, &worker_url)?;

    // Every connection opened below dies when the transaction leaves
    // the phases in which talking to the seller is legal.
    let exit = CancellationToken::new();
    let _exit_guard = exit.clone().drop_guard();
    let (registrations, registration_rx) = mpsc::channel(4);
    let _watchdog = watchdog::spawn(env.tracker.subscribe(), exit, registration_rx, |view: &TxView| {
        match &view.tx {
            Some(tx) => {
                tx.state == TxState::Active
                    && matches!(
                        tx.phase,
                        TxPhase::SellerEstablished | TxPhase::Transmitting | TxPhase::Working
                    )
            }
            None => false,
        }
    });

    let client = ScopedClient::new()?;
    let _scope_guard = client.scope_token().drop_guard();
    let _ = registrations.send(client.scope_token()).await;

    let mut caps = WorkerCaps::default();
    if work.is_chunked() {
        match probe_capabilities(&client, &worker_url).await {
            Ok(probed) => caps = probed,
            Err(e) => {
                tracing::warn!(error = %e, "capability probe failed, assuming plain seller");
            }
        }
    }
    let chunked = caps.adler32_chunking && work.is_chunked();
    let compressed = caps.gzip_compression;
    let legacy = !caps.sync_info;
    tracing::debug!(chunked, compressed, legacy, "work transmission mode");

    let response = if chunked {
        transmit_chunked(env, &client, work, &worker_url, &seller_node, compressed, legacy)
            .await?
    } else {
        transmit_linear(env, &client, work, &worker_url).await?
    };

    let mut temp = env
        .ctx
        .store
        .create(&format!("buy {}: encrypted result", env.tx_id));
    let received = client.copy_body(response, &mut temp).await?;
    temp.close()
        .map_err(|e| TradeError::Transport(e.to_string()))?;
    let enc_result = temp
        .file()
        .map_err(|e| TradeError::Transport(e.to_string()))?;
    tracing::info!(bytes = received, key = %enc_result.key(), "encrypted result received");
    env.shared.exec_sync(|s| s.enc_result = Some(enc_result));

    sign_receipt(env, &client, &worker_url).await
}

/// `OPTIONS` probe of the seller's worker.
async fn probe_capabilities(client: &ScopedClient, worker_url: &str) -> Result<WorkerCaps> {
    let response = client
        .execute(client.request(Method::OPTIONS, worker_url))
        .await?;
    if response.status() != StatusCode::OK {
        return Err(TradeError::SellerProtocol(format!(
            "capability probe returned status {}",
            response.status()
        )));
    }
    let body = client.read_body(response).await?;
    serde_json::from_slice(&body).map_err(|e| {
        TradeError::SellerProtocol(format!("malformed capability document: {e}"))
    })
}

/// Linear path: one multipart POST carrying the raw work and the
/// buyer's secret. The response body is the encrypted result stream.
async fn transmit_linear(
    env: &TransferEnv,
    client: &ScopedClient,
    work: &File,
    worker_url: &str,
) -> Result<reqwest::Response> {
    tracing::info!(url = %worker_url, size = work.size(), "sending work data to seller");

    let (writer, body) = pipe::pipe();
    let error_handle = writer.error_handle();
    let mut form = MultipartWriter::new(writer);
    let content_type = form.content_type();

    let work = work.duplicate();
    let secret_hex = env.secret.to_hex();
    let shared = env.shared.clone();
    let _producer = tokio::task::spawn_blocking(move || {
        let produce = || -> io::Result<()> {
            form.begin_file_part("work", "workfile.bin")?;
            let mut reader = work.open();
            io::copy(&mut reader, &mut form)?;
            // Work bytes are out; the admission permit frees up before
            // the secret goes over the wire.
            shared.exec_sync(|s| s.permit = None);
            form.write_field("buyersecret", &secret_hex)?;
            let writer = form.finish()?;
            writer.finish()
        };
        match produce() {
            Ok(()) => tracing::debug!("work transmitted"),
            Err(e) => {
                tracing::warn!(error = %e, "work transmission failed");
                error_handle.close_with_error(e);
            }
        }
    });

    post_to_seller(client, worker_url, content_type, false, body).await
}

/// Chunked path: sync-info header, wishlist, then the bodies of the
/// missing chunks. The response body of the second POST is the
/// encrypted result stream.
async fn transmit_chunked(
    env: &TransferEnv,
    client: &ScopedClient,
    work: &File,
    worker_url: &str,
    seller_node: &str,
    compressed: bool,
    legacy: bool,
) -> Result<reqwest::Response> {
    let num_chunks = work.num_chunks();
    if num_chunks > MAX_WORK_FILE_CHUNKS {
        return Err(TradeError::WorkTooLarge {
            chunks: num_chunks,
            limit: MAX_WORK_FILE_CHUNKS,
        });
    }

    let mut info = SyncInfo::from_file(work);
    let mut assist_node = None;
    if legacy {
        info.set_trivial_permutation();
    } else {
        info.set_random_permutation(&mut rand::thread_rng());

        // Sellers speaking the modern header also handle assistive
        // download tickets for this work.
        let ticket_client = client.clone();
        let ticket_url = worker_url.to_string();
        env.ctx.tickets.init_node(
            seller_node,
            &info.handprint(),
            Box::new(move |ticket| {
                let client = ticket_client.clone();
                let url = ticket_url.clone();
                let _ = tokio::spawn(post_assist_ticket(client, url, ticket));
            }),
        );
        assist_node = Some(AssistNodeGuard {
            tickets: env.ctx.tickets.clone(),
            seller: seller_node.to_string(),
        });
    }

    let wishlist_response =
        request_missing_chunks(env, client, worker_url, &info, legacy, compressed).await?;
    receive_assist_tickets(&env.ctx.tickets, seller_node, &wishlist_response);
    let wishlist_bytes = client.read_body(wishlist_response).await?;
    let wishlist = Wishlist::from_bytes(&wishlist_bytes, num_chunks);
    tracing::debug!(
        requested = wishlist.num_requested(),
        of = num_chunks,
        "wishlist received"
    );

    let response =
        send_chunk_data(env, client, work, worker_url, seller_node, &info, wishlist, compressed)
            .await?;
    drop(assist_node);
    Ok(response)
}

/// First chunked POST: the sync-info header plus the buyer's secret.
/// The response body is the wishlist bit stream.
async fn request_missing_chunks(
    env: &TransferEnv,
    client: &ScopedClient,
    worker_url: &str,
    info: &SyncInfo,
    legacy: bool,
    compressed: bool,
) -> Result<reqwest::Response> {
    tracing::info!(url = %worker_url, chunks = info.num_chunks(), legacy, "sending work sync info to seller");

    let (writer, body) = pipe::pipe();
    let error_handle = writer.error_handle();
    let compressor = Compressor::new(writer, compressed);
    let mut form = MultipartWriter::new(compressor);
    let content_type = form.content_type();

    let info = info.clone();
    let secret_hex = env.secret.to_hex();
    let _producer = tokio::task::spawn_blocking(move || {
        let produce = || -> io::Result<()> {
            if legacy {
                form.begin_file_part("a32chunks", "a32chunks.bin")?;
                info.write_legacy(&mut form).map_err(sync_io)?;
            } else {
                form.begin_file_part("syncinfojson", "syncinfo.json")?;
                serde_json::to_writer(&mut form, &info)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            }
            form.write_field("buyersecret", &secret_hex)?;
            let compressor = form.finish()?;
            let writer = compressor.finish()?;
            writer.finish()
        };
        match produce() {
            Ok(()) => tracing::debug!("work sync info transmitted"),
            Err(e) => {
                tracing::warn!(error = %e, "sync info transmission failed");
                error_handle.close_with_error(e);
            }
        }
    });

    post_to_seller(client, worker_url, content_type, compressed, body).await
}

/// Second chunked POST: the bodies of the wished-for chunks, gzip-framed
/// with per-chunk flushes when the seller accepts compression. The
/// response body is the encrypted result stream.
#[allow(clippy::too_many_arguments)]
async fn send_chunk_data(
    env: &TransferEnv,
    client: &ScopedClient,
    work: &File,
    worker_url: &str,
    seller_node: &str,
    info: &SyncInfo,
    wishlist: Wishlist,
    compressed: bool,
) -> Result<reqwest::Response> {
    tracing::info!(
        requested = wishlist.num_requested(),
        compressed,
        "sending chunk data to seller"
    );

    let (writer, body) = pipe::pipe();
    let error_handle = writer.error_handle();
    let compressor = Compressor::new(writer, compressed);
    let mut form = MultipartWriter::new(compressor);
    let content_type = form.content_type();

    let work = work.duplicate();
    let info = info.clone();
    let shared = env.shared.clone();
    let tickets = env.ctx.tickets.clone();
    let seller_node = seller_node.to_string();
    let _producer = tokio::task::spawn_blocking(move || {
        let produce = || -> io::Result<()> {
            form.begin_file_part("chunkdata", "chunkdata.bin")?;
            let mut progress = |total: u64, done: u64| {
                shared.exec_sync(|s| {
                    s.bytes_to_transfer = total;
                    s.bytes_transferred = done;
                });
            };
            codec::write_chunk_data(&work, &wishlist, &info, &mut form, &mut progress)
                .map_err(sync_io)?;
            let compressor = form.finish()?;
            let writer = compressor.finish()?;
            writer.finish()
        };
        match produce() {
            Ok(()) => {
                // The chunk stream is out: return the transmission
                // permit and stop asking for assistance.
                shared.exec_sync(|s| s.permit = None);
                tickets.set_node_interested(&seller_node, false);
                tracing::debug!("chunk data transmitted");
            }
            Err(e) => {
                tracing::warn!(error = %e, "chunk data transmission failed");
                error_handle.close_with_error(e);
            }
        }
    });

    post_to_seller(client, worker_url, content_type, compressed, body).await
}

/// POST a streamed body to the seller's worker, failing on any non-200
/// answer with a short excerpt of the response.
async fn post_to_seller(
    client: &ScopedClient,
    worker_url: &str,
    content_type: String,
    compressed: bool,
    body: pipe::PipeBody,
) -> Result<reqwest::Response> {
    let mut request = client
        .request(Method::POST, worker_url)
        .header(header::CONTENT_TYPE, content_type);
    if compressed {
        request = request.header(header::CONTENT_ENCODING, "gzip");
    }
    let response = client.execute(request.body(reqwest::Body::from(body))).await?;
    if response.status() != StatusCode::OK {
        let status = response.status();
        let excerpt = client.read_error_excerpt(response).await;
        return Err(TradeError::SellerProtocol(format!(
            "seller returned status {status} [{excerpt:?}]"
        )));
    }
    Ok(response)
}

/// Record tickets offered in the wishlist response header.
fn receive_assist_tickets(
    tickets: &TicketRegistry,
    seller_node: &str,
    response: &reqwest::Response,
) {
    let Some(value) = response.headers().get(ASSIST_TICKET_HEADER) else {
        return;
    };
    let raw = match value.to_str() {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable assist ticket header");
            return;
        }
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(offered) => {
            for ticket in &offered {
                tracing::debug!(ticket = %ticket, "assist ticket received");
                tickets.new_ticket(ticket, seller_node);
            }
        }
        Err(e) => tracing::warn!(error = %e, content = raw, "malformed assist ticket header"),
    }
}

/// Fire-and-forget forwarding of an assist ticket to the seller.
/// Failures are logged, never surfaced.
async fn post_assist_ticket(client: ScopedClient, worker_url: String, ticket: String) {
    let mut form = MultipartWriter::new(Vec::new());
    let content_type = form.content_type();
    let body = match form
        .write_field("assisturl", &ticket)
        .and_then(|()| form.finish())
    {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "assist ticket body failed");
            return;
        }
    };

    let request = client
        .request(Method::POST, &worker_url)
        .header(header::CONTENT_TYPE, content_type)
        .body(body);
    match client.execute(request).await {
        Ok(response) if response.status() == StatusCode::OK => {
            tracing::debug!(ticket = %ticket, "assist ticket forwarded");
        }
        Ok(response) => {
            tracing::warn!(status = %response.status(), "assist ticket rejected");
        }
        Err(e) => tracing::warn!(error = %e, "assist ticket send failed"),
    }
}

/// Sign the encrypted result's key and deliver the receipt. A 200 from
/// the seller makes the coordinator publish the decryption key.
async fn sign_receipt(env: &TransferEnv, client: &ScopedClient, worker_url: &str) -> Result<()> {
    let enc_hash = env
        .shared
        .read(|s| s.enc_result.as_ref().map(|f| f.key()))
        .ok_or_else(|| TradeError::Crypto("no encrypted result to receipt".to_string()))?;
    let enc_hash_hex = enc_hash.to_hex();
    let signature = env.ctx.identity.sign(enc_hash_hex.as_bytes());
    env.shared
        .exec_sync(|s| s.enc_result_sig = Some(signature.clone()));

    let body = format!("encresulthash={enc_hash_hex}&encresulthashsig={signature}");
    let request = client
        .request(Method::POST, worker_url)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body);
    let response = client.execute(request).await?;
    if response.status() != StatusCode::OK {
        return Err(TradeError::SellerProtocol(format!(
            "receipt rejected with status {}",
            response.status()
        )));
    }
    tracing::info!("receipt for encrypted result signed");
    Ok(())
}

/// Registry identity of a seller for ticket handling: the seller id
/// combined with the worker host.
fn seller_node_id(seller: &str, worker_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(worker_url)
        .map_err(|e| TradeError::SellerProtocol(format!("invalid worker URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| TradeError::SellerProtocol("worker URL has no host".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{seller}_{host}:{port}"),
        None => format!("{seller}_{host}"),
    })
}

/// Guard dropping a registered assist node on every exit path.
struct AssistNodeGuard {
    tickets: TicketRegistry,
    seller: String,
}

impl Drop for AssistNodeGuard {
    fn drop(&mut self) {
        self.tickets.exit_node(&self.seller);
    }
}

fn sync_io(e: umber_sync::SyncError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seller_node_id_includes_host_and_port() {
        let id = seller_node_id("seller-1", "http://worker.example:8082/path").expect("id");
        assert_eq!(id, "seller-1_worker.example:8082");
    }

    #[test]
    fn test_seller_node_id_without_port() {
        let id = seller_node_id("s", "https://worker.example/").expect("id");
        assert_eq!(id, "s_worker.example");
    }

    #[test]
    fn test_seller_node_id_rejects_garbage() {
        assert!(seller_node_id("s", "not a url").is_err());
    }
}
