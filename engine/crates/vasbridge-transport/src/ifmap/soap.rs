//! SOAP envelopes for IF-MAP 2.0 requests and parsing of their responses

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt::Write;

use super::{Identifier, PublishRequest, IFMAP_NS, META_NS, META_PREFIX};
use crate::error::TransportError;

const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

fn envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <env:Envelope xmlns:env=\"{}\" xmlns:ifmap=\"{}\" xmlns:{}=\"{}\">\
         <env:Body>{}</env:Body></env:Envelope>",
        SOAP_NS, IFMAP_NS, META_PREFIX, META_NS, body
    )
}

pub fn new_session() -> String {
    envelope("<ifmap:newSession/>")
}

pub fn renew_session(session_id: &str) -> String {
    envelope(&format!(
        "<ifmap:renewSession session-id=\"{}\"/>",
        escape(session_id)
    ))
}

pub fn end_session(session_id: &str) -> String {
    envelope(&format!(
        "<ifmap:endSession session-id=\"{}\"/>",
        escape(session_id)
    ))
}

pub fn purge_publisher(session_id: &str, publisher_id: &str) -> String {
    envelope(&format!(
        "<ifmap:purgePublisher session-id=\"{}\" ifmap-publisher-id=\"{}\"/>",
        escape(session_id),
        escape(publisher_id)
    ))
}

pub fn publish(session_id: &str, request: &PublishRequest) -> String {
    let mut body = String::new();
    let _ = write!(body, "<ifmap:publish session-id=\"{}\">", escape(session_id));
    for element in &request.elements {
        element.write_xml(&mut body);
    }
    body.push_str("</ifmap:publish>");
    envelope(&body)
}

/// Search one hop along `device-ip` links from `start`
pub fn search_device(session_id: &str, start: &Identifier) -> String {
    let mut body = String::new();
    let _ = write!(
        body,
        "<ifmap:search session-id=\"{}\" match-links=\"meta:device-ip\" max-depth=\"1\" result-filter=\"meta:device-ip\">",
        escape(session_id)
    );
    start.write_xml(&mut body);
    body.push_str("</ifmap:search>");
    envelope(&body)
}

/// Session data from a `newSessionResult`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub publisher_id: String,
}

fn attribute(start: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, TransportError> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| TransportError::Xml(e.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Outcome of scanning a response for the expected result element
struct ResponseScan {
    found: bool,
    session: Option<SessionInfo>,
    devices: Vec<String>,
}

/// Record what a start or empty element contributes; returns its local name
fn on_element(
    e: &BytesStart<'_>,
    expected: &str,
    scan: &mut ResponseScan,
    error_code: &mut Option<String>,
) -> Result<String, TransportError> {
    let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    if local == "errorResult" {
        *error_code = Some(attribute(e, b"errorCode")?.unwrap_or_else(|| "Failure".into()));
    } else if local == expected {
        scan.found = true;
        if local == "newSessionResult" {
            let session_id = attribute(e, b"session-id")?;
            let publisher_id = attribute(e, b"ifmap-publisher-id")?;
            if let (Some(session_id), Some(publisher_id)) = (session_id, publisher_id) {
                scan.session = Some(SessionInfo {
                    session_id,
                    publisher_id,
                });
            }
        }
    }
    Ok(local)
}

/// Walk a response, returning an `errorResult` as [`TransportError::Ifmap`]
/// and collecting what the callers need from the expected result element.
fn scan_response(xml: &str, expected: &str) -> Result<ResponseScan, TransportError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut scan = ResponseScan {
        found: false,
        session: None,
        devices: Vec::new(),
    };
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut error_code: Option<String> = None;
    let mut error_text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let local = on_element(&e, expected, &mut scan, &mut error_code)?;
                stack.push(local);
            }
            Event::Empty(e) => {
                on_element(&e, expected, &mut scan, &mut error_code)?;
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                let parent = stack.last().map(String::as_str);
                let grandparent = stack.len().checked_sub(2).map(|i| stack[i].as_str());
                if parent == Some("errorString") {
                    error_text = text;
                } else if parent == Some("name") && grandparent == Some("device") {
                    scan.devices.push(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(code) = error_code {
        return Err(TransportError::Ifmap {
            code,
            message: error_text,
        });
    }
    Ok(scan)
}

pub fn parse_new_session(xml: &str) -> Result<SessionInfo, TransportError> {
    scan_response(xml, "newSessionResult")?
        .session
        .ok_or_else(|| TransportError::UnexpectedResponse("no newSessionResult in response".into()))
}

/// Check a response for `expected` (e.g. `publishReceived`)
pub fn parse_ack(xml: &str, expected: &str) -> Result<(), TransportError> {
    if scan_response(xml, expected)?.found {
        Ok(())
    } else {
        Err(TransportError::UnexpectedResponse(format!(
            "expected {} in response",
            expected
        )))
    }
}

/// Device names found in a `searchResult`, in document order
pub fn parse_search_devices(xml: &str) -> Result<Vec<String>, TransportError> {
    let scan = scan_response(xml, "searchResult")?;
    if !scan.found {
        return Err(TransportError::UnexpectedResponse(
            "expected searchResult in response".into(),
        ));
    }
    Ok(scan.devices)
}
