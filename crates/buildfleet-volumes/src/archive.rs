// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory tar+gzip packing and unpacking.
//!
//! The volume streaming contract is always a gzip-compressed tar archive of
//! relative paths. These helpers build and dissect such archives entirely in
//! memory; they back the in-process volume backend, single-file extraction,
//! and the workspace's tests.

use std::collections::BTreeMap;
use std::io::Read;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures::StreamExt;
use tar::{Archive, Builder, Header};

use crate::backend::ByteStream;
use crate::error::{Result, VolumeError};

/// Build a tar+gzip archive from (relative path, content) entries.
pub fn pack(entries: &BTreeMap<String, Vec<u8>>) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (name, data) in entries {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    builder.into_inner()?.finish()
}

/// Dissect a tar+gzip archive into (relative path, content) entries.
/// Non-file entries (directories, links) are skipped.
pub fn unpack(bytes: &[u8]) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut entries = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }
    Ok(entries)
}

/// Read the first file entry of a tar+gzip archive.
pub fn first_entry(bytes: &[u8], handle: &str, path: &str) -> Result<(String, Vec<u8>)> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().map_err(VolumeError::Archive)? {
        let mut entry = entry.map_err(VolumeError::Archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(VolumeError::Archive)?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(VolumeError::Archive)?;
        return Ok((name, data));
    }
    Err(VolumeError::NoSuchPath {
        handle: handle.to_string(),
        path: path.to_string(),
    })
}

/// Drain a byte stream into memory.
pub async fn collect(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(bytes)
}

/// A single-chunk byte stream over an in-memory buffer.
pub fn stream_from_bytes(bytes: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::once(async move {
        Ok(Bytes::from(bytes))
    }))
}
