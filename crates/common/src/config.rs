use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::KeepService;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config file has no clusters")]
    NoCluster,
    #[error("config file has {0} clusters; expected exactly one")]
    MultipleClusters(usize),
    #[error("invalid duration {0:?}")]
    Duration(String),
    #[error("{0}")]
    Invalid(String),
}

/// Go-style duration string (`"300ms"`, `"10s"`, `"1h30m"`). Bare numbers
/// are seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub time::Duration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(time::Duration::from_secs(secs))
    }

    pub fn as_std(&self) -> time::Duration {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::Duration(s.to_string()));
        }
        if let Ok(secs) = s.parse::<f64>() {
            return Ok(Self(time::Duration::from_secs_f64(secs.max(0.0))));
        }

        let mut total = 0f64;
        let mut rest = s;
        while !rest.is_empty() {
            let num_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| ConfigError::Duration(s.to_string()))?;
            let value: f64 = rest[..num_len]
                .parse()
                .map_err(|_| ConfigError::Duration(s.to_string()))?;
            rest = &rest[num_len..];
            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let scale = match &rest[..unit_len] {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                _ => return Err(ConfigError::Duration(s.to_string())),
            };
            total += value * scale;
            rest = &rest[unit_len..];
        }
        Ok(Self(time::Duration::from_secs_f64(total)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(f64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Duration::parse(&s).map_err(serde::de::Error::custom),
            Raw::Secs(secs) => Ok(Duration(time::Duration::from_secs_f64(secs.max(0.0)))),
        }
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub clusters: BTreeMap<String, Cluster>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(text)?;
        for (id, cluster) in config.clusters.iter_mut() {
            if cluster.cluster_id.is_empty() {
                cluster.cluster_id = id.clone();
            }
        }
        Ok(config)
    }

    pub fn single_cluster(self) -> Result<Cluster, ConfigError> {
        match self.clusters.len() {
            0 => Err(ConfigError::NoCluster),
            1 => {
                let cluster = self
                    .clusters
                    .into_values()
                    .next()
                    .ok_or(ConfigError::NoCluster)?;
                cluster.validate()?;
                Ok(cluster)
            }
            n => Err(ConfigError::MultipleClusters(n)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Cluster {
    #[serde(rename = "ClusterID")]
    pub cluster_id: String,
    pub system_root_token: String,
    pub services: Services,
    pub remote_clusters: HashMap<String, RemoteCluster>,
    pub login: LoginConfig,
    pub collections: CollectionsConfig,
    #[serde(rename = "API")]
    pub api: ApiConfig,
    pub containers: ContainersConfig,
    pub instance_types: BTreeMap<String, InstanceType>,
    pub database: DatabaseConfig,
    #[serde(rename = "TLS")]
    pub tls: TlsConfig,
    pub keep_balance: KeepBalanceConfig,
}

impl Cluster {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::ids::is_cluster_id(&self.cluster_id) {
            return Err(ConfigError::Invalid(format!(
                "invalid ClusterID {:?}",
                self.cluster_id
            )));
        }
        if self.collections.blob_signing && self.collections.blob_signing_key.is_empty() {
            return Err(ConfigError::Invalid(
                "Collections.BlobSigning is enabled but BlobSigningKey is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn proxy_remotes(&self) -> impl Iterator<Item = (&String, &RemoteCluster)> {
        self.remote_clusters
            .iter()
            .filter(move |(id, remote)| remote.proxy && id.as_str() != self.cluster_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Services {
    pub controller: Service,
    #[serde(rename = "RailsAPI")]
    pub rails_api: Service,
    pub keepstore: Service,
    pub keepbalance: Service,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Service {
    #[serde(rename = "InternalURLs")]
    pub internal_urls: BTreeMap<String, serde_yaml::Value>,
    #[serde(rename = "ExternalURL")]
    pub external_url: String,
}

impl Service {
    pub fn first_internal_url(&self) -> Option<&str> {
        self.internal_urls.keys().next().map(String::as_str)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteCluster {
    pub host: String,
    pub scheme: String,
    pub insecure: bool,
    pub proxy: bool,
    pub activate_users: bool,
}

impl Default for RemoteCluster {
    fn default() -> Self {
        Self {
            host: String::new(),
            scheme: "https".to_string(),
            insecure: false,
            proxy: false,
            activate_users: false,
        }
    }
}

impl RemoteCluster {
    pub fn base_url(&self) -> String {
        let scheme = if self.scheme.is_empty() {
            "https"
        } else {
            &self.scheme
        };
        format!("{scheme}://{}", self.host)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoginConfig {
    pub login_cluster: String,
    #[serde(rename = "TokenLifetime")]
    pub token_lifetime: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CollectionsConfig {
    pub blob_signing: bool,
    pub blob_signing_key: String,
    #[serde(rename = "BlobSigningTTL")]
    pub blob_signing_ttl: Duration,
    pub default_replication: i64,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            blob_signing: true,
            blob_signing_key: String::new(),
            blob_signing_ttl: Duration::from_secs(336 * 3600),
            default_replication: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiConfig {
    pub max_items_per_response: usize,
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_items_per_response: 1000,
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainersConfig {
    pub dispatch_private_key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InstanceType {
    #[serde(rename = "VCPUs")]
    pub vcpus: i64,
    #[serde(rename = "RAM")]
    pub ram: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/arvados/persistence.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TlsConfig {
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KeepBalanceConfig {
    pub run_period: Duration,
    pub collection_batch_size: usize,
    pub collection_buffers: usize,
    pub keep_service_types: Vec<String>,
    pub keep_service_list: Vec<KeepService>,
}

impl Default for KeepBalanceConfig {
    fn default() -> Self {
        Self {
            run_period: Duration::from_secs(600),
            collection_batch_size: 1000,
            collection_buffers: 1000,
            keep_service_types: vec!["disk".to_string()],
            keep_service_list: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_go_syntax() {
        assert_eq!(Duration::parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(Duration::parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(Duration::parse("336h").unwrap(), Duration::from_secs(336 * 3600));
        assert_eq!(
            Duration::parse("250ms").unwrap().as_std(),
            time::Duration::from_millis(250)
        );
        assert_eq!(Duration::parse("42").unwrap(), Duration::from_secs(42));
        assert!(Duration::parse("5 parsecs").is_err());
        assert!(Duration::parse("").is_err());
    }

    #[test]
    fn cluster_config_loads_from_yaml() {
        let config = Config::from_yaml(
            r#"
Clusters:
  zzzzz:
    SystemRootToken: systemroottoken
    Services:
      Controller:
        ExternalURL: https://zzzzz.example.com
        InternalURLs:
          "http://127.0.0.1:8003": {}
      RailsAPI:
        InternalURLs:
          "http://127.0.0.1:8004": {}
    RemoteClusters:
      bbbbb:
        Host: bbbbb.example.com
        Proxy: true
      ccccc:
        Host: ccccc.example.com
        Scheme: http
    Login:
      LoginCluster: bbbbb
    Collections:
      BlobSigningKey: abcdef
      BlobSigningTTL: 2h
    API:
      MaxItemsPerResponse: 5
    KeepBalance:
      RunPeriod: 30s
"#,
        )
        .unwrap();
        let cluster = config.single_cluster().unwrap();
        assert_eq!(cluster.cluster_id, "zzzzz");
        assert_eq!(
            cluster.services.rails_api.first_internal_url(),
            Some("http://127.0.0.1:8004")
        );
        assert_eq!(cluster.login.login_cluster, "bbbbb");
        assert_eq!(cluster.collections.blob_signing_ttl, Duration::from_secs(7200));
        assert_eq!(cluster.api.max_items_per_response, 5);
        assert_eq!(cluster.keep_balance.run_period, Duration::from_secs(30));
        assert_eq!(cluster.keep_balance.keep_service_types, vec!["disk"]);

        let proxies: Vec<_> = cluster.proxy_remotes().map(|(id, _)| id.as_str()).collect();
        assert_eq!(proxies, vec!["bbbbb"]);
        assert_eq!(
            cluster.remote_clusters["ccccc"].base_url(),
            "http://ccccc.example.com"
        );
    }

    #[test]
    fn signing_without_key_is_rejected() {
        let config = Config::from_yaml("Clusters:\n  zzzzz:\n    Collections:\n      BlobSigning: true\n").unwrap();
        assert!(matches!(config.single_cluster(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_file_must_name_one_cluster() {
        let config = Config::from_yaml("Clusters:\n  aaaaa: {}\n  bbbbb: {}\n").unwrap();
        assert!(matches!(
            config.single_cluster(),
            Err(ConfigError::MultipleClusters(2))
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "Clusters:\n  zzzzz:\n    Collections:\n      BlobSigningKey: k\n",
        )
        .unwrap();
        let cluster = Config::load(&path).unwrap().single_cluster().unwrap();
        assert_eq!(cluster.collections.blob_signing_key, "k");
        assert!(Config::load(dir.path().join("missing.yml")).is_err());
    }
}
