use ipnetwork::IpNetwork;
use std::net::IpAddr;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("目标地址为空")]
    Empty,
    #[error("{0} 是一个网段，只能测量单个服务器")]
    Cidr(String),
    #[error("无法识别的目标地址: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Ipv4,
    Ipv6,
    Domain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub kind: TargetKind,
}

impl Target {
    // IPv6地址只能用IPv6去测
    pub fn prefers_ipv6(&self, requested: bool) -> bool {
        requested || self.kind == TargetKind::Ipv6
    }
}

// 检查目标是IPv4地址、IPv6地址还是域名，顺便去掉 http://、末尾的 "/" 和IPv6的方括号
pub fn classify_target(input: &str) -> Result<Target, TargetError> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(TargetError::Empty);
    }

    let host = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url_parse = Url::parse(trimmed).map_err(|_| TargetError::Invalid(input.to_string()))?;
        match url_parse.host_str() {
            Some(host) => host.to_string(),
            None => {
                return Err(TargetError::Invalid(input.to_string()));
            }
        }
    } else {
        trimmed.to_string()
    };
    let host = host.trim_matches(|c| c == '[' || c == ']').to_string();

    if let Ok(ip) = host.parse::<IpAddr>() {
        let kind = if ip.is_ipv6() { TargetKind::Ipv6 } else { TargetKind::Ipv4 };
        return Ok(Target { host: ip.to_string(), kind });
    }
    if host.parse::<IpNetwork>().is_ok() {
        return Err(TargetError::Cidr(host));
    }
    if is_domain(&host) {
        return Ok(Target { host: host.to_ascii_lowercase(), kind: TargetKind::Domain });
    }
    Err(TargetError::Invalid(input.to_string()))
}

fn is_domain(host: &str) -> bool {
    host.len() <= 253 &&
        host
            .split('.')
            .all(|label| {
                !label.is_empty() &&
                    label.len() <= 63 &&
                    !label.starts_with('-') &&
                    !label.ends_with('-') &&
                    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
}
