//! OMP command documents and response parsing

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use vasbridge_core::{Nvt, Report, RiskFactor, ThreatLevel, Vulnerability};

use crate::error::TransportError;
use crate::types::{CommandStatus, ScanConfigInfo, TargetInfo, TaskInfo};

// ── Commands ─────────────────────────────────────────────────────────────────

pub fn authenticate(username: &str, password: &str) -> String {
    format!(
        "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
        escape(username),
        escape(password)
    )
}

pub fn get_tasks() -> String {
    String::from("<get_tasks/>")
}

pub fn get_report(report_id: &str) -> String {
    format!(
        "<get_reports report_id=\"{}\" details=\"1\" ignore_pagination=\"1\"/>",
        escape(report_id)
    )
}

pub fn get_targets() -> String {
    String::from("<get_targets/>")
}

pub fn get_configs() -> String {
    String::from("<get_configs/>")
}

pub fn create_target(name: &str, hosts: &str) -> String {
    format!(
        "<create_target><name>{}</name><hosts>{}</hosts></create_target>",
        escape(name),
        escape(hosts)
    )
}

pub fn create_task(name: &str, config_id: &str, target_id: &str) -> String {
    format!(
        "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/></create_task>",
        escape(name),
        escape(config_id),
        escape(target_id)
    )
}

pub fn start_task(task_id: &str) -> String {
    format!("<start_task task_id=\"{}\"/>", escape(task_id))
}

pub fn delete_task(task_id: &str) -> String {
    format!("<delete_task task_id=\"{}\"/>", escape(task_id))
}

// ── Document tree ────────────────────────────────────────────────────────────

/// Minimal element tree; OMP responses are small enough to hold in memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, TransportError> {
        let mut element = Element {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            ..Element::default()
        };
        for attr in start.attributes() {
            let attr = attr.map_err(|e| TransportError::Xml(e.to_string()))?;
            element.attributes.push((
                String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned(),
                attr.unescape_value()?.into_owned(),
            ));
        }
        Ok(element)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of a direct child, `None` if missing or empty
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }
}

/// Parse a complete response document into its root element
pub fn parse(xml: &str) -> Result<Element, TransportError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => stack.push(Element::from_start(&e)?),
            Event::Empty(e) => {
                let element = Element::from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::End(_) => {
                if let Some(element) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
            }
            Event::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| TransportError::UnexpectedResponse("empty OMP response".into()))
}

/// Length of the first complete document in `bytes`, `None` while the root
/// element is still open
pub fn document_len(bytes: &[u8]) -> Option<usize> {
    let mut reader = Reader::from_reader(bytes);
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(reader.buffer_position());
                }
            }
            Ok(Event::Empty(_)) if depth == 0 => return Some(reader.buffer_position()),
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Status attributes of a response root
pub fn status(root: &Element) -> CommandStatus {
    let status = root
        .attr("status")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    CommandStatus::new(status, root.attr("status_text").unwrap_or_default())
}

/// Fail unless the response carries a 2xx status
pub fn check(command: &str, root: &Element) -> Result<CommandStatus, TransportError> {
    let status = status(root);
    if status.is_success() {
        Ok(status)
    } else {
        Err(TransportError::Omp {
            command: command.to_string(),
            status: status.status,
            message: status.text,
        })
    }
}

/// Id of the entity a `create_*` command made
pub fn created_id(command: &str, root: &Element) -> Result<String, TransportError> {
    root.attr("id")
        .map(str::to_string)
        .ok_or_else(|| TransportError::UnexpectedResponse(format!("{} returned no id", command)))
}

pub fn tasks(root: &Element) -> Vec<TaskInfo> {
    root.children("task")
        .filter_map(|task| {
            let id = task.attr("id")?;
            let mut info = TaskInfo::new(id, task.child_text("name").unwrap_or_default());
            info.status = task.child_text("status").map(str::to_string);
            info.last_report_id = task
                .child("last_report")
                .and_then(|l| l.child("report"))
                .and_then(|r| r.attr("id"))
                .map(str::to_string);
            Some(info)
        })
        .collect()
}

pub fn targets(root: &Element) -> Vec<TargetInfo> {
    root.children("target")
        .filter_map(|t| {
            Some(TargetInfo {
                id: t.attr("id")?.to_string(),
                name: t.child_text("name").unwrap_or_default().to_string(),
            })
        })
        .collect()
}

pub fn configs(root: &Element) -> Vec<ScanConfigInfo> {
    root.children("config")
        .filter_map(|c| {
            Some(ScanConfigInfo {
                id: c.attr("id")?.to_string(),
                name: c.child_text("name").unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Scanner timestamps come as RFC 3339 or, from older scanners, as
/// `Tue Jun 25 10:24:32 2013`
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%a %b %e %H:%M:%S %Y")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_result(result: &Element, fallback: DateTime<Utc>) -> Option<Vulnerability> {
    let id = result.attr("id")?;
    let host = result.child_text("host").unwrap_or_default();

    let nvt = result.child("nvt").map(|nvt| {
        let mut builder = Nvt::builder(nvt.attr("oid").unwrap_or_default())
            .name(nvt.child_text("name").unwrap_or_default())
            .cvss_base(
                nvt.child_text("cvss_base")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
            )
            .risk_factor(RiskFactor::from_scanner(
                nvt.child_text("risk_factor").unwrap_or_default(),
            ));
        if let Some(cve) = nvt.child_text("cve") {
            builder = builder.cve(cve);
        }
        if let Some(bid) = nvt.child_text("bid") {
            builder = builder.bid(bid);
        }
        builder.build()
    });

    let timestamp = result
        .child_text("creation_time")
        .and_then(parse_timestamp)
        .unwrap_or(fallback);

    let mut builder = Vulnerability::builder(id, host)
        .timestamp(timestamp)
        .port(result.child_text("port").unwrap_or_default())
        .threat(ThreatLevel::from_scanner(
            result.child_text("threat").unwrap_or_default(),
        ))
        .description(result.child_text("description").unwrap_or_default());
    if let Some(subnet) = result.child_text("subnet") {
        builder = builder.subnet(subnet);
    }
    if let Some(nvt) = nvt {
        builder = builder.nvt(nvt);
    }
    Some(builder.build())
}

/// Build the report of `task_id` from a `get_reports_response`
pub fn report(task_id: &str, root: &Element) -> Result<Report, TransportError> {
    let outer = root
        .child("report")
        .ok_or_else(|| TransportError::UnexpectedResponse("no report in get_reports_response".into()))?;
    // Report content is nested one level deeper in the XML report format
    let inner = outer.child("report").unwrap_or(outer);

    let fallback = inner
        .child_text("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let vulnerabilities = inner
        .child("results")
        .map(|results| {
            results
                .children("result")
                .filter_map(|r| parse_result(r, fallback))
                .collect()
        })
        .unwrap_or_default();

    Ok(Report::new(task_id, vulnerabilities))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS: &str = r#"<get_tasks_response status="200" status_text="OK">
        <task id="t-1"><name>nightly</name>
            <config id="c-1"><name>Full and fast</name></config>
            <target id="g-1"><name>office</name></target>
            <status>Done</status>
            <last_report><report id="r-9"><timestamp>2013-06-25T10:20:42Z</timestamp></report></last_report>
        </task>
        <task id="t-2"><name>fresh</name><status>New</status></task>
    </get_tasks_response>"#;

    const REPORT: &str = r#"<get_reports_response status="200" status_text="OK">
        <report id="r-9" format_id="a994b278" extension="xml">
          <report id="r-9">
            <timestamp>2013-06-25T10:20:42Z</timestamp>
            <host_start><host>192.168.7.7</host>2013-06-25T10:20:45Z</host_start>
            <results start="1" max="2">
              <result id="res-1">
                <subnet>192.168.7.0</subnet>
                <host>192.168.7.7</host>
                <port>http (80/tcp)</port>
                <nvt oid="1.3.6.1.4.1.25623.1.0.11229">
                  <name>phpinfo.php</name>
                  <cvss_base>0.0</cvss_base>
                  <risk_factor>None</risk_factor>
                  <cve>NOCVE</cve>
                  <bid>NOBID</bid>
                </nvt>
                <threat>Medium</threat>
                <description>phpinfo() &amp; friends</description>
              </result>
              <result id="res-2">
                <host>192.168.7.8</host>
                <port>https (443/tcp)</port>
                <nvt oid="1.3.6.1.4.1.25623.1.0.902799">
                  <name>SSL/TLS BEAST</name>
                  <cvss_base>4.3</cvss_base>
                  <risk_factor>Medium</risk_factor>
                  <cve>CVE-2011-3389</cve>
                </nvt>
                <threat>Bogus</threat>
                <creation_time>2013-06-25T10:24:32+02:00</creation_time>
              </result>
            </results>
          </report>
        </report>
    </get_reports_response>"#;

    #[test]
    fn test_parse_tasks_ignores_nested_names() {
        let tasks = tasks(&parse(TASKS).unwrap());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "nightly");
        assert_eq!(tasks[0].status.as_deref(), Some("Done"));
        assert_eq!(tasks[0].last_report_id.as_deref(), Some("r-9"));
        assert_eq!(tasks[1].last_report_id, None);
    }

    #[test]
    fn test_parse_report() {
        let report = report("t-1", &parse(REPORT).unwrap()).unwrap();
        assert_eq!(report.task_id, "t-1");
        assert_eq!(report.len(), 2);

        let first = &report.vulnerabilities[0];
        assert_eq!(first.subnet, "192.168.7.0");
        assert_eq!(first.threat, ThreatLevel::Medium);
        assert_eq!(first.description, "phpinfo() & friends");
        assert_eq!(first.nvt.risk_factor, RiskFactor::None);
        assert_eq!(first.timestamp.to_rfc3339(), "2013-06-25T10:20:42+00:00");

        let second = &report.vulnerabilities[1];
        assert_eq!(second.subnet, "192.168.7.8");
        assert_eq!(second.threat, ThreatLevel::Log);
        assert_eq!(second.nvt.cvss_base, 4.3);
        assert_eq!(second.nvt.bid, "NOBID");
        assert_eq!(second.timestamp.to_rfc3339(), "2013-06-25T08:24:32+00:00");
    }

    #[test]
    fn test_report_without_timestamp_uses_epoch() {
        let xml = r#"<get_reports_response status="200"><report id="r"><results>
            <result id="x"><host>10.0.0.1</host></result></results></report></get_reports_response>"#;
        let report = report("t", &parse(xml).unwrap()).unwrap();
        assert_eq!(report.vulnerabilities[0].timestamp, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_legacy_timestamp_format() {
        let ts = parse_timestamp("Tue Jun 25 10:24:32 2013").unwrap();
        assert_eq!(ts.to_rfc3339(), "2013-06-25T10:24:32+00:00");
    }

    #[test]
    fn test_check_status() {
        let ok = parse(r#"<start_task_response status="202" status_text="OK, request submitted"/>"#).unwrap();
        assert_eq!(check("start_task", &ok).unwrap().status, 202);

        let bad = parse(r#"<delete_task_response status="404" status_text="Failed to find task"/>"#).unwrap();
        match check("delete_task", &bad) {
            Err(TransportError::Omp { command, status, message }) => {
                assert_eq!(command, "delete_task");
                assert_eq!(status, 404);
                assert_eq!(message, "Failed to find task");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_created_id() {
        let root = parse(r#"<create_target_response status="201" status_text="OK, resource created" id="g-7"/>"#).unwrap();
        assert_eq!(created_id("create_target", &root).unwrap(), "g-7");
    }

    #[test]
    fn test_document_len() {
        assert_eq!(document_len(b"<a status=\"200\"/>"), Some(17));
        assert_eq!(document_len(b"<a><b>x</b>"), None);
        assert_eq!(document_len(b"<a><b>x</b></a>"), Some(15));
        assert_eq!(document_len(b"<a><b>x</b"), None);
    }

    #[test]
    fn test_commands_escape_values() {
        assert_eq!(
            create_target("a<b", "10.0.0.1"),
            "<create_target><name>a&lt;b</name><hosts>10.0.0.1</hosts></create_target>"
        );
        assert!(authenticate("admin", "p&w").contains("<password>p&amp;w</password>"));
    }
}
