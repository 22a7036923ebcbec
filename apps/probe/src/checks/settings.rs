//! Typed access to the free-form settings map attached to each check.
//!
//! The control plane ships settings as loose JSON, and older servers
//! send numbers as strings, so the accessors accept both spellings
//! before enforcing ranges.

use std::net::IpAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::Settings;

pub const MAX_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 100 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing required setting {0:?}")]
    Missing(&'static str),
    #[error("invalid value for setting {0:?}")]
    Invalid(&'static str),
}

pub fn opt_string(settings: &Settings, key: &'static str) -> Result<Option<String>, SettingsError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SettingsError::Invalid(key)),
    }
}

pub fn req_string(settings: &Settings, key: &'static str) -> Result<String, SettingsError> {
    match opt_string(settings, key)? {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(SettingsError::Missing(key)),
    }
}

pub fn opt_number(settings: &Settings, key: &'static str) -> Result<Option<f64>, SettingsError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or(SettingsError::Invalid(key)),
        Some(Value::String(s)) => {
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>().map(Some).map_err(|_| SettingsError::Invalid(key))
        }
        Some(_) => Err(SettingsError::Invalid(key)),
    }
}

pub fn opt_bool(settings: &Settings, key: &'static str) -> Result<Option<bool>, SettingsError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.to_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" | "" => Ok(Some(false)),
            _ => Err(SettingsError::Invalid(key)),
        },
        Some(_) => Err(SettingsError::Invalid(key)),
    }
}

/// Port setting, range 1-65535.
pub fn port(settings: &Settings, key: &'static str, default: u16) -> Result<u16, SettingsError> {
    match opt_number(settings, key)? {
        None => Ok(default),
        Some(n) => {
            if n.fract() != 0.0 || !(1.0..=65535.0).contains(&n) {
                return Err(SettingsError::Invalid(key));
            }
            Ok(n as u16)
        }
    }
}

/// Timeout setting in seconds, `0 < t <= 10`.
pub fn timeout(settings: &Settings, default_secs: f64) -> Result<Duration, SettingsError> {
    let secs = opt_number(settings, "timeout")?.unwrap_or(default_secs);
    if secs <= 0.0 || secs > MAX_TIMEOUT.as_secs_f64() {
        return Err(SettingsError::Invalid("timeout"));
    }
    Ok(Duration::from_secs_f64(secs))
}

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)([km]?)b?$").expect("size regex"));

/// The downloadLimit setting: a plain byte count or a size string such
/// as `100kb`, `2M`, `1024`.
pub fn download_limit(
    settings: &Settings,
    key: &'static str,
    default: usize,
) -> Result<usize, SettingsError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) if v > 0 => Ok(v as usize),
            _ => Err(SettingsError::Invalid(key)),
        },
        Some(Value::String(s)) => {
            if s.is_empty() {
                return Ok(default);
            }
            let caps = SIZE_RE.captures(s).ok_or(SettingsError::Invalid(key))?;
            let count: usize =
                caps[1].parse().map_err(|_| SettingsError::Invalid(key))?;
            let multiplier = match caps[2].to_lowercase().as_str() {
                "k" => 1024,
                "m" => 1024 * 1024,
                _ => 1,
            };
            Ok(count * multiplier)
        }
        Some(_) => Err(SettingsError::Invalid(key)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    V4,
    V6,
    #[default]
    Any,
}

impl IpVersion {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        match opt_string(settings, "ipversion")?.as_deref() {
            None | Some("") | Some("any") => Ok(IpVersion::Any),
            Some("v4") => Ok(IpVersion::V4),
            Some("v6") => Ok(IpVersion::V6),
            Some(_) => Err(SettingsError::Invalid("ipversion")),
        }
    }

    pub fn permits(&self, ip: &IpAddr) -> bool {
        match self {
            IpVersion::Any => true,
            IpVersion::V4 => ip.is_ipv4(),
            IpVersion::V6 => ip.is_ipv6(),
        }
    }
}

/// Resolve `host` through the OS resolver and return the first address
/// that matches the ipversion filter and is globally unicast or
/// loopback. Error strings are user-visible check output.
pub async fn resolve_host(host: &str, ipversion: IpVersion) -> Result<IpAddr, String> {
    let addrs = tokio::net::lookup_host((host, 0u16))
        .await
        .map_err(|_| "failed to resolve hostname to IP.".to_string())?;

    for addr in addrs {
        let ip = addr.ip();
        if ipversion.permits(&ip) && reachable_unicast(&ip) {
            return Ok(ip);
        }
    }
    Err("failed to resolve hostname to valid IP.".to_string())
}

fn reachable_unicast(ip: &IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_unspecified() && !v4.is_multicast() && !v4.is_broadcast() && !v4.is_link_local()
        }
        IpAddr::V6(v6) => !v6.is_unspecified() && !v6.is_multicast(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(pairs: &[(&str, Value)]) -> Settings {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn numbers_accept_both_spellings() {
        let s = settings(&[("port", json!(8080)), ("timeout", json!("2.5"))]);
        assert_eq!(port(&s, "port", 80).unwrap(), 8080);
        assert_eq!(timeout(&s, 5.0).unwrap(), Duration::from_secs_f64(2.5));
    }

    #[test]
    fn port_range_is_enforced() {
        assert_eq!(port(&settings(&[]), "port", 80).unwrap(), 80);
        assert!(port(&settings(&[("port", json!(0))]), "port", 80).is_err());
        assert!(port(&settings(&[("port", json!(65536))]), "port", 80).is_err());
        assert!(port(&settings(&[("port", json!("banana"))]), "port", 80).is_err());
        assert_eq!(port(&settings(&[("port", json!("443"))]), "port", 80).unwrap(), 443);
    }

    #[test]
    fn timeout_must_be_positive_and_capped() {
        assert!(timeout(&settings(&[("timeout", json!(0))]), 5.0).is_err());
        assert!(timeout(&settings(&[("timeout", json!(-1))]), 5.0).is_err());
        assert!(timeout(&settings(&[("timeout", json!(11))]), 5.0).is_err());
        assert_eq!(timeout(&settings(&[("timeout", json!(10))]), 5.0).unwrap(), MAX_TIMEOUT);
        assert_eq!(timeout(&settings(&[]), 5.0).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn download_limit_parses_size_strings() {
        let cases = [
            (json!("1024"), 1024),
            (json!("100kb"), 100 * 1024),
            (json!("100KB"), 100 * 1024),
            (json!("2m"), 2 * 1024 * 1024),
            (json!("2Mb"), 2 * 1024 * 1024),
            (json!(4096), 4096),
        ];
        for (value, expected) in cases {
            let s = settings(&[("downloadLimit", value.clone())]);
            assert_eq!(
                download_limit(&s, "downloadLimit", DEFAULT_DOWNLOAD_LIMIT).unwrap(),
                expected,
                "value {value}"
            );
        }
        assert_eq!(
            download_limit(&settings(&[]), "downloadLimit", DEFAULT_DOWNLOAD_LIMIT).unwrap(),
            DEFAULT_DOWNLOAD_LIMIT
        );
        assert!(
            download_limit(
                &settings(&[("downloadLimit", json!("100gb"))]),
                "downloadLimit",
                DEFAULT_DOWNLOAD_LIMIT
            )
            .is_err()
        );
    }

    #[test]
    fn ipversion_accepts_known_values_only() {
        assert_eq!(IpVersion::from_settings(&settings(&[])).unwrap(), IpVersion::Any);
        let s = settings(&[("ipversion", json!("v6"))]);
        assert_eq!(IpVersion::from_settings(&s).unwrap(), IpVersion::V6);
        let s = settings(&[("ipversion", json!("ipv4"))]);
        assert_eq!(IpVersion::from_settings(&s), Err(SettingsError::Invalid("ipversion")));
    }

    #[test]
    fn ipversion_filters_addresses() {
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        let v6: IpAddr = "2606:2800:220:1::1".parse().unwrap();
        assert!(IpVersion::V4.permits(&v4));
        assert!(!IpVersion::V4.permits(&v6));
        assert!(IpVersion::V6.permits(&v6));
        assert!(IpVersion::Any.permits(&v4) && IpVersion::Any.permits(&v6));
    }

    #[test]
    fn unusable_addresses_are_skipped() {
        assert!(reachable_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(reachable_unicast(&"93.184.216.34".parse().unwrap()));
        assert!(!reachable_unicast(&"0.0.0.0".parse().unwrap()));
        assert!(!reachable_unicast(&"224.0.0.1".parse().unwrap()));
        assert!(!reachable_unicast(&"ff02::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn resolves_loopback_names() {
        let ip = resolve_host("localhost", IpVersion::Any).await.unwrap();
        assert!(ip.is_loopback());
    }
}
