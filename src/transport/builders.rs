use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Method;

use crate::error::transport_failure;

use super::info::{RequestBody, RequestInfo, ResponseHandler};

/// Derives the caller-chosen block id for block `index` of `blob_id`, base64-encoded the way a
/// block-blob client would (spec §3/§6 glossary: "block id"). Deterministic rather than random:
/// spec §3 requires that for uploads the `BlockTransfer` id "doubles as the block identifier
/// sent to the service", so re-decomposing the same blob on resume must mint the exact same ids
/// the server already has bytes for, not fresh ones.
pub fn block_id_for(blob_id: &str, index: u32) -> String {
    BASE64.encode(format!("{blob_id}:{index:08}"))
}

fn query(url: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = url.to_string();
    out.push('?');
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(&utf8_percent_encode(v, NON_ALPHANUMERIC).to_string());
    }
    out
}

/// Result of probing a remote destination: its current size and whether it exists at all,
/// parsed from a `Content-Range` header the way a resumable client reads upload offsets.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub exists: bool,
    pub total_size: Option<u64>,
}

pub fn probe_request(base_url: &str, timeout: Duration) -> RequestInfo<ProbeResult> {
    let handler: ResponseHandler<ProbeResult> = Arc::new(|payload| {
        if payload.status.as_u16() == 404 {
            return Ok(ProbeResult {
                exists: false,
                total_size: None,
            });
        }
        let total_size = payload
            .headers
            .get("content-range")
            .and_then(|range| parse_content_range_total(range));
        Ok(ProbeResult {
            exists: true,
            total_size,
        })
    });

    RequestInfo::new(base_url, Method::HEAD, timeout, handler)
        .with_success_codes(vec![200, 404])
}

fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.parse().ok()
}

pub fn get_range_request(
    base_url: &str,
    start: u64,
    end: u64,
    timeout: Duration,
) -> RequestInfo<Vec<u8>> {
    let handler: ResponseHandler<Vec<u8>> = Arc::new(|payload| Ok(payload.body));

    let mut request = RequestInfo::new(base_url, Method::GET, timeout, handler)
        .with_success_codes(vec![200, 206]);
    request
        .headers
        .insert("Range".to_string(), format!("bytes={start}-{}", end.saturating_sub(1)));
    request
}

pub fn put_block_request(
    base_url: &str,
    block_id: &str,
    chunk: Vec<u8>,
    timeout: Duration,
) -> RequestInfo<()> {
    let handler: ResponseHandler<()> = Arc::new(|_payload| Ok(()));
    let url = query(base_url, &[("comp", "block"), ("blockid", block_id)]);

    let mut request = RequestInfo::new(url, Method::PUT, timeout, handler)
        .with_body(RequestBody::Bytes(chunk))
        .with_success_codes(vec![201]);
    request
        .headers
        .insert("Content-Type".to_string(), "application/octet-stream".to_string());
    request
}

pub fn commit_block_list_request(
    base_url: &str,
    block_ids: &[String],
    content_type: Option<&str>,
    timeout: Duration,
) -> RequestInfo<()> {
    let handler: ResponseHandler<()> = Arc::new(|payload| {
        if payload.status.as_u16() == 201 {
            Ok(())
        } else {
            Err(transport_failure("commit did not return 201"))
        }
    });

    let url = query(base_url, &[("comp", "blocklist")]);
    let body = render_block_list_xml(block_ids);

    let mut request = RequestInfo::new(url, Method::PUT, timeout, handler)
        .with_body(RequestBody::Text(body))
        .with_success_codes(vec![201]);
    request.headers.insert(
        "Content-Type".to_string(),
        "application/xml".to_string(),
    );
    if let Some(content_type) = content_type {
        request
            .headers
            .insert("x-blob-content-type".to_string(), content_type.to_string());
    }
    request
}

fn render_block_list_xml(block_ids: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        body.push_str("<Latest>");
        body.push_str(id);
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_for_is_base64_and_varies_by_index() {
        let a = block_id_for("blob-1", 0);
        let b = block_id_for("blob-1", 1);
        assert_ne!(a, b);
        assert!(BASE64.decode(&a).is_ok());
    }

    #[test]
    fn block_id_for_is_stable_across_calls() {
        assert_eq!(block_id_for("blob-1", 3), block_id_for("blob-1", 3));
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("bytes 0-99/1000"), Some(1000));
        assert_eq!(parse_content_range_total("not-a-range"), None);
    }

    #[test]
    fn block_list_xml_preserves_order() {
        let xml = render_block_list_xml(&["aaa".to_string(), "bbb".to_string()]);
        assert!(xml.find("aaa").unwrap() < xml.find("bbb").unwrap());
    }
}
