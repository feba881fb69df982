/// mDNS service type advertised by model inference instances
pub const INSTANCE_SERVICE_TYPE: &str = "_model-inference._tcp.local.";

/// TXT record keys used by inference instances
pub const TXT_SERVICE: &str = "service";
pub const TXT_HEALTHY: &str = "healthy";

/// Path appended to an instance base URL for inference calls
pub const INFERENCE_PATH: &str = "/inference";

/// Multipart part name carrying the input file
pub const FILE_PART: &str = "file";

/// Registry service name for a deployed model: `model_{id}_{format}_{version}`
pub fn model_service_name(model_id: u64, format: &str, version: &str) -> String {
    format!("model_{}_{}_{}", model_id, format, version)
}
