//! Image download and verification.
//!
//! Content is streamed into a staging file and hashed on the way. Only
//! bytes whose length and every declared hash match the target are
//! committed; anything else is discarded before an installer or secondary
//! can see it.

use std::io::{self, Read, Write};

use crate::interfaces::{TransferError, Transport};
use crate::logging::LogContext;
use crate::metadata::{ContentHasher, Hashes, Target};
use crate::storage::{Storage, StorageError};

use super::events::{Event, EventSender};
use super::shutdown::ShutdownToken;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
/// Bytes between two progress events of one download.
const PROGRESS_INTERVAL: u64 = 1024 * 1024;

fn storage_error(e: StorageError) -> TransferError {
    TransferError::Io(e.to_string())
}

/// Hash everything `reader` yields, stopping one byte past `limit`.
///
/// `on_progress` sees the running byte count every `PROGRESS_INTERVAL`
/// bytes and once more at the end.
fn measure(
    reader: &mut dyn Read,
    limit: u64,
    mut sink: impl Write,
    on_progress: &mut dyn FnMut(u64),
) -> io::Result<(u64, Hashes)> {
    let mut hasher = ContentHasher::new();
    let mut limited = reader.take(limit.saturating_add(1));
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut received = 0u64;
    let mut reported = 0u64;
    loop {
        let n = limited.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        sink.write_all(&buf[..n])?;
        received += n as u64;
        if received - reported >= PROGRESS_INTERVAL {
            on_progress(received);
            reported = received;
        }
    }
    sink.flush()?;
    if received != reported || received == 0 {
        on_progress(received);
    }
    Ok(hasher.finish())
}

fn mismatch(target: &Target, length: u64) -> TransferError {
    let reason = if length != target.length {
        format!("length {} (expected {})", length, target.length)
    } else {
        "hash mismatch".to_string()
    };
    TransferError::ContentMismatch {
        filename: target.filename.clone(),
        reason,
    }
}

/// Check the committed copy of `target` in storage.
///
/// A copy that does not match is removed.
pub fn verify_stored_target(storage: &dyn Storage, target: &Target) -> Result<(), TransferError> {
    let mut reader = storage
        .open_target(&target.filename)
        .map_err(storage_error)?
        .ok_or_else(|| TransferError::NotFound(target.filename.clone()))?;
    let (length, hashes) = measure(&mut reader, target.length, io::sink(), &mut |_| {})
        .map_err(|e| TransferError::Io(e.to_string()))?;
    drop(reader);

    if target.matches_content(length, &hashes) {
        return Ok(());
    }
    storage.remove_target(&target.filename).map_err(storage_error)?;
    Err(mismatch(target, length))
}

fn fetch_once(
    transport: &dyn Transport,
    storage: &dyn Storage,
    target: &Target,
    events: &EventSender,
) -> Result<(), TransferError> {
    let mut reader = transport.fetch_image(target)?;
    let staged = storage.stage_target(&target.filename).map_err(storage_error)?;
    let mut on_progress = |received| {
        events.emit(Event::DownloadProgress {
            filename: target.filename.clone(),
            received,
            total: target.length,
        })
    };
    let measured = measure(&mut reader, target.length, staged, &mut on_progress);

    let (length, hashes) = match measured {
        Ok(m) => m,
        Err(e) => {
            storage.discard_target(&target.filename).map_err(storage_error)?;
            return Err(TransferError::Network(e.to_string()));
        }
    };
    if !target.matches_content(length, &hashes) {
        storage.discard_target(&target.filename).map_err(storage_error)?;
        return Err(mismatch(target, length));
    }
    storage.commit_target(&target.filename).map_err(storage_error)
}

/// Download `target` into storage, retrying transport failures up to
/// `retries` times.
///
/// Content that does not match is never retried; the server would serve
/// the same bytes again. Progress of each attempt goes to `events`.
pub fn download_target(
    transport: &dyn Transport,
    storage: &dyn Storage,
    target: &Target,
    retries: u32,
    ctx: &LogContext,
    shutdown: &ShutdownToken,
    events: &EventSender,
) -> Result<(), TransferError> {
    if verify_stored_target(storage, target).is_ok() {
        log::debug!("{} DOWNLOAD_SKIPPED filename={} reason=already_stored", ctx, target.filename);
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        if shutdown.is_requested() {
            return Err(TransferError::Interrupted);
        }
        attempt += 1;
        match fetch_once(transport, storage, target, events) {
            Ok(()) => {
                log::info!(
                    "{} DOWNLOAD_COMPLETE filename={} length={} attempts={}",
                    ctx,
                    target.filename,
                    target.length,
                    attempt
                );
                return Ok(());
            }
            Err(e @ TransferError::Network(_)) if attempt <= retries => {
                log::warn!(
                    "{} DOWNLOAD_RETRY filename={} attempt={} error={}",
                    ctx,
                    target.filename,
                    attempt,
                    e
                );
            }
            Err(e) => {
                log::warn!(
                    "{} DOWNLOAD_FAILED filename={} attempts={} error={}",
                    ctx,
                    target.filename,
                    attempt,
                    e
                );
                return Err(e);
            }
        }
    }
}
