use std::env;

/// Runtime settings for the promotion studio, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub page_size: usize,
    pub body_limit: usize,
    pub metrics_key: Option<String>,
    pub http: HttpSettings,
    pub catalog_url: String,
    pub image: ImageApiConfig,
    pub proxy_base_url: String,
    pub image_max_bytes: usize,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ImageApiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub size: String,
    pub quality: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_url: Option<String>,
    pub service_key: Option<String>,
    pub bucket: String,
    pub prefix: String,
    pub collection: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = parse_env("PORT").unwrap_or(8000);
        Self {
            port,
            page_size: parse_env::<usize>("PAGE_SIZE")
                .filter(|v| *v > 0)
                .unwrap_or(10),
            body_limit: parse_env::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            metrics_key: non_empty_env("METRICS_KEY"),
            http: HttpSettings::from_env(),
            catalog_url: non_empty_env("CATALOG_API_URL")
                .unwrap_or_else(|| "http://localhost:8000/".into()),
            image: ImageApiConfig::from_env(),
            proxy_base_url: non_empty_env("PROXY_BASE_URL")
                .unwrap_or_else(|| format!("http://127.0.0.1:{port}/")),
            image_max_bytes: parse_env::<usize>("IMAGE_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(20 * 1024 * 1024),
            storage: StorageConfig::from_env(),
        }
    }
}

impl HttpSettings {
    pub fn from_env() -> Self {
        Self {
            timeout_secs: parse_env("HTTP_TIMEOUT_SECS").unwrap_or(60),
            connect_timeout_secs: parse_env("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            connect_timeout_secs: 5,
        }
    }
}

impl ImageApiConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: non_empty_env("IMAGE_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1/images/generations".into()),
            api_key: non_empty_env("IMAGE_API_KEY"),
            model: non_empty_env("IMAGE_MODEL").unwrap_or_else(|| "dall-e-3".into()),
            size: non_empty_env("IMAGE_SIZE").unwrap_or_else(|| "1024x1024".into()),
            quality: non_empty_env("IMAGE_QUALITY"),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: non_empty_env("SUPABASE_URL"),
            service_key: non_empty_env("SUPABASE_SERVICE_ROLE_KEY")
                .or_else(|| non_empty_env("SUPABASE_SERVICE_KEY"))
                .or_else(|| non_empty_env("SUPABASE_KEY")),
            bucket: non_empty_env("PROMO_BUCKET").unwrap_or_else(|| "assets".into()),
            prefix: non_empty_env("PROMO_PREFIX").unwrap_or_else(|| "promotions".into()),
            collection: non_empty_env("PROMO_COLLECTION")
                .unwrap_or_else(|| "promotional_images".into()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
