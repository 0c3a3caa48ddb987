//! Forwardable services and tunnel requests.
//!
//! A device exposes a catalog of [`ServiceDescriptor`]s, each naming a TCP
//! endpoint reachable from the device.  The client asks for a tunnel with a
//! [`ServiceSpec`], written on the command line as `name` or `name:port`:
//!
//! ```text
//! ssh        -> service "ssh", any free local port
//! ssh:2222   -> service "ssh", local port 2222
//! ssh:abc    -> rejected (InvalidPortFormat)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder shown for fields the device did not report.
pub const UNKNOWN: &str = "Unknown";

/// One entry in a device's service catalog.
///
/// `port == 0` means the device did not report a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(rename = "Id", default = "unknown")]
    pub id: String,
    #[serde(rename = "Type", default = "unknown")]
    pub service_type: String,
    #[serde(rename = "Host", default = "unknown")]
    pub host: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl ServiceDescriptor {
    pub fn new(
        id: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.into(),
            host: host.into(),
            port,
        }
    }
}

/// Renders as a single display line: `id type host:port`.
///
/// Whitespace and backslashes inside a field are escaped with a backslash so
/// the line always splits back into the same four fields.
impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:",
            Escaped(&self.id),
            Escaped(&self.service_type),
            Escaped(&self.host)
        )?;
        if self.port == 0 {
            f.write_str(UNKNOWN)
        } else {
            write!(f, "{}", self.port)
        }
    }
}

struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c == '\\' || c.is_whitespace() {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Splits a service line on unescaped spaces into at most three fields.
fn split_line(line: &str) -> Result<Vec<String>, ServiceLineError> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let current = fields.len() - 1;
        match c {
            '\\' => match chars.next() {
                Some(escaped) => fields[current].push(escaped),
                None => return Err(ServiceLineError::DanglingEscape),
            },
            ' ' if fields.len() < 3 => fields.push(String::new()),
            c => fields[current].push(c),
        }
    }
    Ok(fields)
}

/// Error returned when a rendered service line cannot be parsed back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceLineError {
    #[error("service line is missing the {0} field")]
    MissingField(&'static str),
    #[error("invalid port {0:?} in service line")]
    InvalidPort(String),
    #[error("service line ends inside an escape")]
    DanglingEscape,
}

impl FromStr for ServiceDescriptor {
    type Err = ServiceLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = split_line(s.trim_end_matches(['\r', '\n']))?.into_iter();
        let id = fields.next().filter(|f| !f.is_empty());
        let id = id.ok_or(ServiceLineError::MissingField("id"))?;
        let service_type = fields.next().ok_or(ServiceLineError::MissingField("type"))?;
        let endpoint = fields.next().ok_or(ServiceLineError::MissingField("host"))?;
        let (host, port_text) = endpoint
            .rsplit_once(':')
            .ok_or(ServiceLineError::MissingField("port"))?;
        let port = if port_text == UNKNOWN {
            0
        } else {
            port_text
                .parse::<u16>()
                .map_err(|_| ServiceLineError::InvalidPort(port_text.to_string()))?
        };
        Ok(Self::new(id, service_type, host, port))
    }
}

/// Error returned for malformed tunnel requests.
///
/// Raised before any network activity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceSpecError {
    #[error("service name must not be empty")]
    InvalidServiceName,
    #[error("invalid local port {0:?}")]
    InvalidPortFormat(String),
}

/// A request to forward a local port to a named service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub service: String,
    /// `0` means "any free local port".
    pub local_port: u16,
}

impl ServiceSpec {
    /// Builds a request from a service name and a requested port.
    ///
    /// A name of the form `name:port` is split first; its port must agree
    /// with `local_port` unless one of them is `0`.
    ///
    /// # Errors
    ///
    /// - [`ServiceSpecError::InvalidServiceName`] for an empty or
    ///   whitespace-only name.
    /// - [`ServiceSpecError::InvalidPortFormat`] for unparsable port text, or
    ///   a port that contradicts `local_port`.
    pub fn new(service: impl Into<String>, local_port: u16) -> Result<Self, ServiceSpecError> {
        let service = service.into();
        if !service.contains(':') {
            return Self::named(service, local_port);
        }
        let split: ServiceSpec = service.parse()?;
        match (split.local_port, local_port) {
            (_, 0) => Ok(split),
            (0, port) => Self::named(split.service, port),
            (a, b) if a == b => Ok(split),
            (a, _) => Err(ServiceSpecError::InvalidPortFormat(a.to_string())),
        }
    }

    fn named(service: String, local_port: u16) -> Result<Self, ServiceSpecError> {
        if service.trim().is_empty() {
            return Err(ServiceSpecError::InvalidServiceName);
        }
        Ok(Self {
            service,
            local_port,
        })
    }
}

impl FromStr for ServiceSpec {
    type Err = ServiceSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => Self::named(s.to_string(), 0),
            Some((name, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| ServiceSpecError::InvalidPortFormat(port_text.to_string()))?;
                Self::named(name.to_string(), port)
            }
        }
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local_port == 0 {
            f.write_str(&self.service)
        } else {
            write!(f, "{}:{}", self.service, self.local_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_with_port_splits_name_and_port() {
        let spec: ServiceSpec = "ssh:2222".parse().unwrap();
        assert_eq!(spec.service, "ssh");
        assert_eq!(spec.local_port, 2222);
    }

    #[test]
    fn test_spec_without_port_requests_any_port() {
        let spec: ServiceSpec = "ssh".parse().unwrap();
        assert_eq!(spec.service, "ssh");
        assert_eq!(spec.local_port, 0);
    }

    #[test]
    fn test_spec_with_text_port_is_invalid_port_format() {
        assert_eq!(
            "ssh:abc".parse::<ServiceSpec>(),
            Err(ServiceSpecError::InvalidPortFormat("abc".to_string()))
        );
    }

    #[test]
    fn test_spec_with_out_of_range_port_is_invalid_port_format() {
        assert!(matches!(
            "ssh:65536".parse::<ServiceSpec>(),
            Err(ServiceSpecError::InvalidPortFormat(_))
        ));
    }

    #[test]
    fn test_spec_with_trailing_colon_is_invalid_port_format() {
        assert_eq!(
            "ssh:".parse::<ServiceSpec>(),
            Err(ServiceSpecError::InvalidPortFormat(String::new()))
        );
    }

    #[test]
    fn test_spec_with_empty_name_is_invalid_service_name() {
        assert_eq!(
            ":22".parse::<ServiceSpec>(),
            Err(ServiceSpecError::InvalidServiceName)
        );
        assert_eq!("".parse::<ServiceSpec>(), Err(ServiceSpecError::InvalidServiceName));
    }

    #[test]
    fn test_spec_display_matches_input_form() {
        assert_eq!("ssh:2222".parse::<ServiceSpec>().unwrap().to_string(), "ssh:2222");
        assert_eq!("http".parse::<ServiceSpec>().unwrap().to_string(), "http");
    }

    #[test]
    fn test_descriptor_line_parses_back_to_same_fields() {
        let original = ServiceDescriptor::new("cam1", "rtsp", "10.0.0.5", 8554);
        let line = original.to_string();
        assert_eq!(line, "cam1 rtsp 10.0.0.5:8554");

        let parsed: ServiceDescriptor = line.parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_descriptor_line_shows_unknown_port() {
        let d = ServiceDescriptor::new("ssh", UNKNOWN, UNKNOWN, 0);
        assert_eq!(d.to_string(), "ssh Unknown Unknown:Unknown");
        assert_eq!(d.to_string().parse::<ServiceDescriptor>().unwrap(), d);
    }

    #[test]
    fn test_descriptor_line_keeps_spaces_inside_fields() {
        let original = ServiceDescriptor::new("front door", "Web UI", "10.0.0.5", 8554);
        let line = original.to_string();
        assert_eq!(line, r"front\ door Web\ UI 10.0.0.5:8554");
        assert_eq!(line.parse::<ServiceDescriptor>().unwrap(), original);
    }

    #[test]
    fn test_descriptor_line_keeps_backslashes_and_colons() {
        let original = ServiceDescriptor::new(r"share\c$", "smb", "fe80::1", 445);
        assert_eq!(original.to_string().parse::<ServiceDescriptor>().unwrap(), original);
    }

    #[test]
    fn test_descriptor_line_rejects_dangling_escape() {
        assert_eq!(
            "cam1 rtsp host:1\\".parse::<ServiceDescriptor>(),
            Err(ServiceLineError::DanglingEscape)
        );
    }

    #[test]
    fn test_new_splits_name_with_port() {
        let spec = ServiceSpec::new("ssh:2222", 0).unwrap();
        assert_eq!((spec.service.as_str(), spec.local_port), ("ssh", 2222));

        let spec = ServiceSpec::new("ssh:2222", 2222).unwrap();
        assert_eq!(spec.local_port, 2222);
    }

    #[test]
    fn test_new_rejects_text_port_in_name() {
        assert_eq!(
            ServiceSpec::new("ssh:abc", 0),
            Err(ServiceSpecError::InvalidPortFormat("abc".to_string()))
        );
    }

    #[test]
    fn test_new_rejects_conflicting_ports() {
        assert!(matches!(
            ServiceSpec::new("ssh:2222", 3333),
            Err(ServiceSpecError::InvalidPortFormat(_))
        ));
    }

    #[test]
    fn test_descriptor_line_rejects_missing_endpoint() {
        assert_eq!(
            "cam1 rtsp".parse::<ServiceDescriptor>(),
            Err(ServiceLineError::MissingField("host"))
        );
    }
}
