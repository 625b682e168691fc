//! Renders the forwarding-client config and manages its temp file.
//!
//! The external client reads its config exactly once at startup, so the
//! writer produces a fresh file for every change to the running-mapping set.
//! The previous file is deleted only after the new one has been written and
//! fsynced — there is never a window without a valid config on disk.
//!
//! Output is the client's plain INI stanza format: a `[common]` section with
//! the server endpoint and token, then one TCP forwarding stanza per running
//! mapping.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::debug;

use crate::config::ServerConfig;

/// One forwarding stanza: public port → local target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStanza {
    /// Stanza name, unique per mapping.
    pub name: String,
    pub public_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

/// Render the full config text. Stanzas are emitted in the order given;
/// callers sort for determinism.
pub fn render(server: &ServerConfig, stanzas: &[TunnelStanza]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[common]");
    let _ = writeln!(out, "server_addr = {}", server.addr);
    let _ = writeln!(out, "server_port = {}", server.port);
    let _ = writeln!(out, "token = {}", server.token);
    for stanza in stanzas {
        let _ = writeln!(out);
        let _ = writeln!(out, "[{}]", stanza.name);
        let _ = writeln!(out, "type = tcp");
        let _ = writeln!(out, "local_ip = {}", stanza.local_host);
        let _ = writeln!(out, "local_port = {}", stanza.local_port);
        let _ = writeln!(out, "remote_port = {}", stanza.public_port);
    }
    out
}

/// Owns the current config temp file. Dropping the writer (or calling
/// [`ConfigWriter::cleanup`]) removes it from disk.
#[derive(Debug, Default)]
pub struct ConfigWriter {
    current: Option<TempPath>,
}

impl ConfigWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a fresh config file and return its path. The previous file is
    /// removed only after the new one is flushed to disk.
    pub fn write(
        &mut self,
        server: &ServerConfig,
        stanzas: &[TunnelStanza],
    ) -> std::io::Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix("portgate-frpc-")
            .suffix(".ini")
            .tempfile()?;
        file.write_all(render(server, stanzas).as_bytes())?;
        file.as_file().sync_all()?;

        let path = file.into_temp_path();
        let result = path.to_path_buf();
        debug!(
            "Tunnel config written to {} ({} stanza(s))",
            result.display(),
            stanzas.len()
        );
        // Replacing the TempPath drops (and deletes) the previous file.
        self.current = Some(path);
        Ok(result)
    }

    /// Path of the current config file, if one exists.
    pub fn path(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Remove the current config file. Best-effort; also happens on drop.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.current.take() {
            debug!("Tunnel config {} removed", path.display());
            drop(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerConfig {
        ServerConfig {
            addr: "frps.example.com".to_string(),
            port: 7000,
            token: "secret".to_string(),
        }
    }

    #[test]
    fn renders_common_section_and_stanzas() {
        let stanzas = vec![
            TunnelStanza {
                name: "plc".to_string(),
                public_port: 20001,
                local_host: "127.0.0.1".to_string(),
                local_port: 24000,
            },
            TunnelStanza {
                name: "ssh".to_string(),
                public_port: 20022,
                local_host: "192.168.1.10".to_string(),
                local_port: 22,
            },
        ];
        let text = render(&server(), &stanzas);
        assert_eq!(
            text,
            "[common]\n\
             server_addr = frps.example.com\n\
             server_port = 7000\n\
             token = secret\n\
             \n\
             [plc]\n\
             type = tcp\n\
             local_ip = 127.0.0.1\n\
             local_port = 24000\n\
             remote_port = 20001\n\
             \n\
             [ssh]\n\
             type = tcp\n\
             local_ip = 192.168.1.10\n\
             local_port = 22\n\
             remote_port = 20022\n"
        );
    }

    #[test]
    fn renders_empty_mapping_set_as_common_only() {
        let text = render(&server(), &[]);
        assert!(text.starts_with("[common]\n"));
        assert!(!text.contains("type = tcp"));
    }

    #[test]
    fn write_replaces_previous_file_after_new_one_exists() {
        let mut writer = ConfigWriter::new();
        let first = writer.write(&server(), &[]).unwrap();
        assert!(first.exists());

        let stanzas = vec![TunnelStanza {
            name: "ssh".to_string(),
            public_port: 20022,
            local_host: "127.0.0.1".to_string(),
            local_port: 22,
        }];
        let second = writer.write(&server(), &stanzas).unwrap();
        assert_ne!(first, second);
        assert!(!first.exists(), "previous config should be deleted");
        assert!(second.exists());

        let contents = std::fs::read_to_string(&second).unwrap();
        assert!(contents.contains("remote_port = 20022"));

        writer.cleanup();
        assert!(!second.exists());
        assert!(writer.path().is_none());
    }

    #[test]
    fn drop_removes_the_file() {
        let mut writer = ConfigWriter::new();
        let path = writer.write(&server(), &[]).unwrap();
        assert!(path.exists());
        drop(writer);
        assert!(!path.exists());
    }
}
