//! HTTPS 监听所需的 TLS 配置：加载证书或生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// 构建 Rustls 配置；未提供证书与私钥时生成自签名证书。
pub async fn build_rustls_config(
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
    host: IpAddr,
) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match (tls_cert, tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        _ => write_self_signed(&std::env::temp_dir(), host)?,
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 在 `dir` 中写入自签名证书与私钥（PEM），返回两者路径。
fn write_self_signed(dir: &Path, host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert = generate_simple_self_signed(names).map_err(|err| io::Error::other(err.to_string()))?;
    let cert_path = dir.join("cortex-cert.pem");
    let key_path = dir.join("cortex-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!(path = ?cert_path, "generated self-signed certificate");
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[test]
    fn self_signed_pair_is_written_as_pem() {
        let temp = tempdir().expect("tempdir");
        let (cert, key) = write_self_signed(temp.path(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .expect("generate certificate");
        let cert = std::fs::read_to_string(cert).expect("cert");
        let key = std::fs::read_to_string(key).expect("key");
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }
}
