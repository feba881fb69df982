use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// One registered instance of a model service, as reported by the registry.
/// Fetched fresh for every dispatch and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// IP address or hostname
    pub address: String,

    /// Service port
    pub port: u16,

    /// Health as reported by the registry
    pub healthy: bool,

    /// Registry metadata (Nacos metadata / TXT records)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            healthy: true,
            attributes: HashMap::new(),
        }
    }

    /// Base URL of the instance, e.g. `http://10.0.0.1:8000` or `http://[fd00::1]:8000`
    pub fn base_url(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{}]:{}", ip, self.port),
            _ => format!("http://{}:{}", self.address, self.port),
        }
    }
}

/// Artifact format of a deployed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Onnx,
    Pytorch,
    Openvino,
    Tensorrt,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Onnx => "onnx",
            ModelFormat::Pytorch => "pytorch",
            ModelFormat::Openvino => "openvino",
            ModelFormat::Tensorrt => "tensorrt",
        }
    }

    /// Guess the format from a model path or any other string hint.
    /// Falls back to `Pytorch` when nothing matches.
    pub fn infer_from_path(hint: &str) -> Self {
        let hint = hint.to_lowercase();

        if hint.contains("onnx") {
            ModelFormat::Onnx
        } else if hint.ends_with(".pt") || hint.ends_with(".pth") {
            ModelFormat::Pytorch
        } else if hint.contains("openvino") {
            ModelFormat::Openvino
        } else if hint.contains("tensorrt") {
            ModelFormat::Tensorrt
        } else {
            ModelFormat::Pytorch
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown model format: {0}")]
pub struct UnknownModelFormat(pub String);

impl FromStr for ModelFormat {
    type Err = UnknownModelFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "onnx" => Ok(ModelFormat::Onnx),
            "pytorch" => Ok(ModelFormat::Pytorch),
            "openvino" => Ok(ModelFormat::Openvino),
            "tensorrt" => Ok(ModelFormat::Tensorrt),
            _ => Err(UnknownModelFormat(s.to_string())),
        }
    }
}

/// Identity of a deployed inference artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelServiceKey {
    pub model_id: u64,
    pub format: ModelFormat,
    pub version: String,
}

impl ModelServiceKey {
    pub fn new(model_id: u64, format: ModelFormat, version: impl Into<String>) -> Self {
        Self {
            model_id,
            format,
            version: version.into(),
        }
    }

    /// Registry service name, `model_{id}_{format}_{version}`
    pub fn service_name(&self) -> String {
        crate::protocol::model_service_name(self.model_id, self.format.as_str(), &self.version)
    }
}

/// A named endpoint whose reachability is tracked by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub name: String,

    /// IP address or hostname that gets probed
    pub address: String,

    /// Result of the most recent completed probe
    pub online: bool,

    /// When that probe completed
    pub last_checked: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_format() {
        let key = ModelServiceKey::new(7, ModelFormat::Onnx, "v2");
        assert_eq!(key.service_name(), "model_7_onnx_v2");

        let same = ModelServiceKey::new(7, ModelFormat::Onnx, "v2");
        assert_eq!(key.service_name(), same.service_name());
    }

    #[test]
    fn test_infer_format() {
        assert_eq!(ModelFormat::infer_from_path("/models/yolo11n.onnx"), ModelFormat::Onnx);
        assert_eq!(ModelFormat::infer_from_path("/models/ONNX/best"), ModelFormat::Onnx);
        assert_eq!(ModelFormat::infer_from_path("/models/best.pt"), ModelFormat::Pytorch);
        assert_eq!(ModelFormat::infer_from_path("weights/last.PTH"), ModelFormat::Pytorch);
        assert_eq!(ModelFormat::infer_from_path("/models/best_openvino_model/"), ModelFormat::Openvino);
        assert_eq!(ModelFormat::infer_from_path("/models/tensorrt/best.engine"), ModelFormat::Tensorrt);
        assert_eq!(ModelFormat::infer_from_path("/models/best.engine"), ModelFormat::Pytorch);
        assert_eq!(ModelFormat::infer_from_path(""), ModelFormat::Pytorch);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("ONNX".parse::<ModelFormat>(), Ok(ModelFormat::Onnx));
        assert_eq!("tensorrt".parse::<ModelFormat>(), Ok(ModelFormat::Tensorrt));
        assert!("caffe".parse::<ModelFormat>().is_err());
    }

    #[test]
    fn test_unknown_format_error() {
        let err = "caffe".parse::<ModelFormat>().unwrap_err();
        assert_eq!(err, UnknownModelFormat("caffe".to_string()));
        assert_eq!(err.to_string(), "unknown model format: caffe");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_base_url() {
        assert_eq!(ServiceInstance::new("10.0.0.1", 8000).base_url(), "http://10.0.0.1:8000");
        assert_eq!(ServiceInstance::new("fd00::1", 8000).base_url(), "http://[fd00::1]:8000");
        assert_eq!(ServiceInstance::new("gpu-node.local", 9000).base_url(), "http://gpu-node.local:9000");
    }
}
