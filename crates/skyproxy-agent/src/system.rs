//! GNOME system proxy sink.
//!
//! Drives `gsettings` under `org.gnome.system.proxy`. HTTP and HTTPS profiles
//! set both the `http` and `https` schemas; SOCKS profiles set the `socks`
//! schema. GNOME has a single SOCKS setting, so SOCKS4 and SOCKS5 both read
//! back as SOCKS5.
//!
//! `query` only reports settings that `apply` can write back unchanged: either
//! one SOCKS endpoint alone, or identical HTTP and HTTPS endpoints without
//! SOCKS. Anything else is `Unsupported`. An endpoint with an empty host is
//! inactive and counts as unset.

use async_trait::async_trait;
use skyproxy_core::{ProxyConfig, ProxyScheme, ProxyServer};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::sink::ProxySettingsSink;

const SCHEMA: &str = "org.gnome.system.proxy";
const HTTP_SCHEMA: &str = "org.gnome.system.proxy.http";
const HTTPS_SCHEMA: &str = "org.gnome.system.proxy.https";
const SOCKS_SCHEMA: &str = "org.gnome.system.proxy.socks";

/// Sink backed by GNOME's proxy settings.
#[derive(Debug, Clone)]
pub struct GnomeProxySink {
    program: String,
}

impl Default for GnomeProxySink {
    fn default() -> Self {
        Self::new()
    }
}

impl GnomeProxySink {
    pub fn new() -> Self {
        Self::with_program("gsettings")
    }

    /// Uses a different `gsettings`-compatible executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, SinkError> {
        debug!(program = %self.program, ?args, "Running settings command");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| SinkError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SinkError::Command {
                command: format!("{} {}", self.program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn get(&self, schema: &str, key: &str) -> Result<String, SinkError> {
        self.run(&["get", schema, key]).await
    }

    async fn set(&self, schema: &str, key: &str, value: &str) -> Result<(), SinkError> {
        self.run(&["set", schema, key, value]).await.map(|_| ())
    }

    async fn set_endpoint(&self, schema: &str, host: &str, port: u16) -> Result<(), SinkError> {
        self.set(schema, "host", &gvariant_string(host)).await?;
        self.set(schema, "port", &port.to_string()).await
    }

    async fn get_endpoint(&self, schema: &str) -> Result<Endpoint, SinkError> {
        Ok(Endpoint {
            host: parse_gvariant_string(&self.get(schema, "host").await?)?,
            port: parse_gvariant_port(&self.get(schema, "port").await?)?,
        })
    }
}

#[async_trait]
impl ProxySettingsSink for GnomeProxySink {
    fn name(&self) -> &'static str {
        "gnome"
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), SinkError> {
        match config {
            ProxyConfig::Direct => {
                self.set(SCHEMA, "mode", "'none'").await?;
            }
            ProxyConfig::FixedServers { rules } => {
                let server = &rules.single_proxy;
                if server.scheme.is_socks() {
                    self.set_endpoint(SOCKS_SCHEMA, &server.host, server.port)
                        .await?;
                    self.set_endpoint(HTTP_SCHEMA, "", 0).await?;
                    self.set_endpoint(HTTPS_SCHEMA, "", 0).await?;
                } else {
                    self.set_endpoint(HTTP_SCHEMA, &server.host, server.port)
                        .await?;
                    self.set_endpoint(HTTPS_SCHEMA, &server.host, server.port)
                        .await?;
                    self.set_endpoint(SOCKS_SCHEMA, "", 0).await?;
                }
                self.set(
                    SCHEMA,
                    "ignore-hosts",
                    &gvariant_string_list(&rules.bypass_list),
                )
                .await?;
                self.set(SCHEMA, "mode", "'manual'").await?;
            }
        }

        info!(config = %config, "GNOME proxy configured");
        Ok(())
    }

    async fn query(&self) -> Result<ProxyConfig, SinkError> {
        let mode = parse_gvariant_string(&self.get(SCHEMA, "mode").await?)?;
        match mode.as_str() {
            "none" => Ok(ProxyConfig::Direct),
            "manual" => {
                let http = self.get_endpoint(HTTP_SCHEMA).await?;
                let https = self.get_endpoint(HTTPS_SCHEMA).await?;
                let socks = self.get_endpoint(SOCKS_SCHEMA).await?;
                let server = restorable_server(http, https, socks)?;

                let bypass_list =
                    parse_gvariant_string_list(&self.get(SCHEMA, "ignore-hosts").await?)?;
                Ok(ProxyConfig::fixed(server, bypass_list))
            }
            other => Err(SinkError::Unsupported(format!("proxy mode '{other}'"))),
        }
    }
}

/// Host and port of one `org.gnome.system.proxy.*` schema.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    fn is_unset(&self) -> bool {
        self.host.is_empty()
    }

    fn into_server(self, scheme: ProxyScheme) -> Result<ProxyServer, SinkError> {
        if self.port == 0 {
            return Err(SinkError::Unsupported(format!(
                "{scheme} endpoint {} without a port",
                self.host
            )));
        }
        Ok(ProxyServer {
            scheme,
            host: self.host,
            port: self.port,
        })
    }
}

/// Maps manual-mode endpoints to the one server `apply` would write them as.
fn restorable_server(
    http: Endpoint,
    https: Endpoint,
    socks: Endpoint,
) -> Result<ProxyServer, SinkError> {
    match (http.is_unset(), https.is_unset(), socks.is_unset()) {
        (true, true, false) => socks.into_server(ProxyScheme::Socks5),
        (false, false, true) if http == https => http.into_server(ProxyScheme::Http),
        (true, true, true) => Err(SinkError::Unsupported(
            "manual mode without an HTTP or SOCKS endpoint".to_string(),
        )),
        _ => Err(SinkError::Unsupported(format!(
            "manual mode with separate endpoints (http {}:{}, https {}:{}, socks {}:{})",
            http.host, http.port, https.host, https.port, socks.host, socks.port
        ))),
    }
}

/// Quotes a string as a GVariant string literal.
pub fn gvariant_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Formats a GVariant `as` literal.
pub fn gvariant_string_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| gvariant_string(v)).collect();
    format!("[{}]", items.join(", "))
}

/// Parses a GVariant string literal as printed by `gsettings get`.
pub fn parse_gvariant_string(text: &str) -> Result<String, SinkError> {
    let text = text.trim();
    let inner = text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| text.strip_prefix('"').and_then(|t| t.strip_suffix('"')))
        .ok_or_else(|| SinkError::Invalid(format!("expected a string, got {text:?}")))?;

    Ok(unescape(inner))
}

/// Parses a GVariant `as` literal, including the empty `@as []` form.
pub fn parse_gvariant_string_list(text: &str) -> Result<Vec<String>, SinkError> {
    let text = text.trim();
    let text = text.strip_prefix("@as").map(str::trim).unwrap_or(text);
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| SinkError::Invalid(format!("expected a string list, got {text:?}")))?;

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(quote) = chars.next() else {
            break;
        };
        if quote != '\'' && quote != '"' {
            return Err(SinkError::Invalid(format!(
                "unexpected {quote:?} in string list {text:?}"
            )));
        }

        let mut item = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        item.push(next);
                    }
                }
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => item.push(c),
            }
        }
        if !closed {
            return Err(SinkError::Invalid(format!("unterminated string in {text:?}")));
        }
        items.push(item);
    }

    Ok(items)
}

/// Parses a port as printed by `gsettings get`.
fn parse_gvariant_port(text: &str) -> Result<u16, SinkError> {
    let text = text.trim();
    let text = text.strip_prefix("int32").map(str::trim).unwrap_or(text);
    text.parse::<u16>()
        .map_err(|_| SinkError::Invalid(format!("expected a port, got {text:?}")))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvariant_string_quoting() {
        assert_eq!(gvariant_string("proxy.local"), "'proxy.local'");
        assert_eq!(gvariant_string("it's"), "'it\\'s'");
        assert_eq!(gvariant_string(""), "''");
    }

    #[test]
    fn test_gvariant_string_list() {
        let list = vec!["localhost".to_string(), "127.0.0.0/8".to_string()];
        assert_eq!(gvariant_string_list(&list), "['localhost', '127.0.0.0/8']");
        assert_eq!(gvariant_string_list(&[]), "[]");
    }

    #[test]
    fn test_parse_string() {
        assert_eq!(parse_gvariant_string("'manual'\n").unwrap(), "manual");
        assert_eq!(parse_gvariant_string("''").unwrap(), "");
        assert_eq!(parse_gvariant_string("'it\\'s'").unwrap(), "it's");
        assert!(parse_gvariant_string("manual").is_err());
    }

    #[test]
    fn test_parse_string_list() {
        assert_eq!(
            parse_gvariant_string_list("['localhost', '127.0.0.0/8', '::1']").unwrap(),
            vec!["localhost", "127.0.0.0/8", "::1"]
        );
        assert!(parse_gvariant_string_list("@as []").unwrap().is_empty());
        assert!(parse_gvariant_string_list("[]").unwrap().is_empty());
        assert!(parse_gvariant_string_list("['open").is_err());
        assert!(parse_gvariant_string_list("localhost").is_err());
    }

    #[test]
    fn test_list_roundtrip_with_quotes() {
        let list = vec!["a'b".to_string(), "*.local".to_string()];
        assert_eq!(
            parse_gvariant_string_list(&gvariant_string_list(&list)).unwrap(),
            list
        );
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_gvariant_port("8080").unwrap(), 8080);
        assert_eq!(parse_gvariant_port("0").unwrap(), 0);
        assert_eq!(parse_gvariant_port("int32 3128").unwrap(), 3128);
        assert!(parse_gvariant_port("'x'").is_err());
    }

    fn endpoint(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_restorable_server() {
        let none = endpoint("", 0);
        let web = endpoint("web.corp", 3128);

        let socks = endpoint("socks.corp", 1080);
        let server = restorable_server(none.clone(), none.clone(), socks.clone()).unwrap();
        assert_eq!(server.scheme, ProxyScheme::Socks5);
        assert_eq!(server.port, 1080);

        let server = restorable_server(web.clone(), web.clone(), endpoint("", 8080)).unwrap();
        assert_eq!(server.scheme, ProxyScheme::Http);
        assert_eq!(server.host, "web.corp");

        // Each of these would lose a setting when written back
        assert!(restorable_server(web.clone(), web.clone(), socks).is_err());
        assert!(restorable_server(web.clone(), endpoint("tls.corp", 443), none.clone()).is_err());
        assert!(restorable_server(web.clone(), none.clone(), none.clone()).is_err());
        assert!(restorable_server(none.clone(), none.clone(), endpoint("socks.corp", 0)).is_err());
        assert!(restorable_server(none.clone(), none.clone(), none).is_err());
    }

    /// Writes a `gsettings` stand-in that keeps each key in a file.
    #[cfg(unix)]
    fn fake_gsettings(dir: &std::path::Path, state: &[GnomeKey]) -> GnomeProxySink {
        use std::os::unix::fs::PermissionsExt;

        let state_dir = dir.join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        for (schema, key, value) in state {
            std::fs::write(state_dir.join(format!("{schema}.{key}")), value).unwrap();
        }

        let script = dir.join("gsettings");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             dir=\"$(dirname \"$0\")/state\"\n\
             case \"$1\" in\n\
             get) cat \"$dir/$2.$3\" ;;\n\
             set) printf '%s' \"$4\" > \"$dir/$2.$3\" ;;\n\
             *) exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        GnomeProxySink::with_program(script.to_string_lossy())
    }

    #[cfg(unix)]
    type GnomeKey = (&'static str, &'static str, String);

    /// Manual mode with the given `(host, port)` literals per schema.
    #[cfg(unix)]
    fn gnome_state(
        http: (&str, &str),
        https: (&str, &str),
        socks: (&str, &str),
    ) -> Vec<GnomeKey> {
        vec![
            (SCHEMA, "mode", "'manual'".to_string()),
            (SCHEMA, "ignore-hosts", "['localhost', '127.0.0.0/8']".to_string()),
            (HTTP_SCHEMA, "host", http.0.to_string()),
            (HTTP_SCHEMA, "port", http.1.to_string()),
            (HTTPS_SCHEMA, "host", https.0.to_string()),
            (HTTPS_SCHEMA, "port", https.1.to_string()),
            (SOCKS_SCHEMA, "host", socks.0.to_string()),
            (SOCKS_SCHEMA, "port", socks.1.to_string()),
        ]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_http_settings_restore_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let state = gnome_state(("'web.corp'", "3128"), ("'web.corp'", "3128"), ("''", "0"));
        let sink = fake_gsettings(dir.path(), &state);

        let snapshot = sink.query().await.unwrap();
        assert_eq!(snapshot.to_string(), "http://web.corp:3128");

        sink.apply(&ProxyConfig::Direct).await.unwrap();
        assert_eq!(sink.query().await.unwrap(), ProxyConfig::Direct);
        sink.apply(&snapshot).await.unwrap();

        assert_eq!(sink.query().await.unwrap(), snapshot);
        assert_eq!(sink.get(HTTPS_SCHEMA, "host").await.unwrap(), "'web.corp'");
        assert_eq!(
            sink.get(SCHEMA, "ignore-hosts").await.unwrap(),
            "['localhost', '127.0.0.0/8']"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mixed_http_and_socks_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let state = gnome_state(
            ("'web.corp'", "3128"),
            ("'web.corp'", "3128"),
            ("'socks.corp'", "1080"),
        );
        let sink = fake_gsettings(dir.path(), &state);

        assert!(matches!(sink.query().await, Err(SinkError::Unsupported(_))));
        assert_eq!(sink.get(HTTP_SCHEMA, "host").await.unwrap(), "'web.corp'");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let sink = GnomeProxySink::with_program("skyproxy-no-such-gsettings");
        let err = sink.query().await.unwrap_err();
        assert!(matches!(err, SinkError::Spawn { .. }));
    }
}
