use anyhow::{anyhow, Result};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Where the upstream NTLM proxy lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ProxyEndpoint {
            host: host.into(),
            port,
            timeout_secs: 30,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ProxyEndpoint {
    fn default() -> Self {
        ProxyEndpoint::new("127.0.0.1", 3128)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub log_path: String,
    pub log_level: String,
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_path: "ntlm-connect.log".to_string(),
            log_level: "info".to_string(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

/// Proxy descriptor consumed by the handshake.
///
/// Empty `domain`, `username` or `password` selects the ambient identity.
/// `headers` are merged into both CONNECT requests.
#[derive(Clone, Default)]
pub struct ProxyConfig {
    pub proxy: ProxyEndpoint,
    pub domain: String,
    pub username: String,
    pub password: String,
    pub headers: HeaderMap,
    pub settings: Settings,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("proxy", &self.proxy)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("headers", &self.headers)
            .field("settings", &self.settings)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProxyConfig implementation
// ---------------------------------------------------------------------------

impl ProxyConfig {
    pub fn with_credentials(
        mut self,
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.domain = domain.into();
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// True when domain, username and password are all set.
    pub fn has_explicit_credentials(&self) -> bool {
        !self.domain.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    /// Append an extra header value sent on every CONNECT request.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow!("Invalid value for header '{}': {}", name, e))?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Load configuration from an XML file.
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::from_xml(&content)
    }

    /// Save configuration to an XML file.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let xml = self.to_xml();
        let mut file = std::fs::File::create(path)
            .map_err(|e| anyhow!("Failed to create config file '{}': {}", path, e))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| anyhow!("Failed to write config file: {}", e))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // XML serialization
    // -----------------------------------------------------------------------

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<ntlm-connect>\n");

        out.push_str("  <settings>\n");
        out.push_str(&format!("    <log_path>{}</log_path>\n", xml_escape(&self.settings.log_path)));
        out.push_str(&format!("    <log_level>{}</log_level>\n", xml_escape(&self.settings.log_level)));
        out.push_str(&format!("    <listen_host>{}</listen_host>\n", xml_escape(&self.settings.listen_host)));
        out.push_str(&format!("    <listen_port>{}</listen_port>\n", self.settings.listen_port));
        out.push_str("  </settings>\n");

        out.push_str(&format!(
            "  <proxy host=\"{}\" port=\"{}\" timeout_secs=\"{}\" domain=\"{}\" username=\"{}\" password=\"{}\">\n",
            xml_escape(&self.proxy.host),
            self.proxy.port,
            self.proxy.timeout_secs,
            xml_escape(&self.domain),
            xml_escape(&self.username),
            xml_escape(&self.password),
        ));
        for (name, value) in self.headers.iter() {
            out.push_str(&format!(
                "    <header name=\"{}\" value=\"{}\"/>\n",
                xml_escape(name.as_str()),
                xml_escape(&String::from_utf8_lossy(value.as_bytes())),
            ));
        }
        out.push_str("  </proxy>\n");

        out.push_str("</ntlm-connect>\n");
        out
    }

    // -----------------------------------------------------------------------
    // XML deserialization (manual quick-xml reader)
    // -----------------------------------------------------------------------

    pub fn from_xml(xml: &str) -> Result<Self> {
        use quick_xml::events::{BytesStart, Event};
        use quick_xml::Reader;

        fn read_proxy(config: &mut ProxyConfig, e: &BytesStart) -> Result<()> {
            for attr in e.attributes().flatten() {
                let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
                let val = attr.unescape_value()?.to_string();
                match key.as_str() {
                    "host" => config.proxy.host = val,
                    "port" => config.proxy.port = val.parse()?,
                    "timeout_secs" => config.proxy.timeout_secs = val.parse()?,
                    "domain" => config.domain = val,
                    "username" => config.username = val,
                    "password" => config.password = val,
                    _ => {}
                }
            }
            Ok(())
        }

        let mut config = ProxyConfig::default();
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut current_section = String::new();
        let mut current_text_tag = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    match name.as_str() {
                        "settings" => current_section = name.clone(),
                        "proxy" => {
                            current_section = name.clone();
                            read_proxy(&mut config, e)?;
                        }
                        tag if current_section == "settings" => {
                            current_text_tag = tag.to_string();
                        }
                        _ => {}
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    match name.as_str() {
                        "proxy" => read_proxy(&mut config, e)?,
                        "header" if current_section == "proxy" => {
                            let mut header_name = String::new();
                            let mut header_value = String::new();
                            for attr in e.attributes().flatten() {
                                let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
                                let val = attr.unescape_value()?.to_string();
                                match key.as_str() {
                                    "name" => header_name = val,
                                    "value" => header_value = val,
                                    _ => {}
                                }
                            }
                            config.add_header(&header_name, &header_value)?;
                        }
                        _ => {}
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if current_section == "settings" && !current_text_tag.is_empty() {
                        let text = e.unescape()?.to_string();
                        match current_text_tag.as_str() {
                            "log_path" => config.settings.log_path = text,
                            "log_level" => config.settings.log_level = text,
                            "listen_host" => config.settings.listen_host = text,
                            "listen_port" => config.settings.listen_port = text.parse()?,
                            _ => {}
                        }
                        current_text_tag.clear();
                    }
                }
                Ok(Event::End(ref e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    if name == current_section {
                        current_section.clear();
                    }
                    current_text_tag.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(anyhow!("XML parse error: {}", e)),
                _ => {}
            }
            buf.clear();
        }

        Ok(config)
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
