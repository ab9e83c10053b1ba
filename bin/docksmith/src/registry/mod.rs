use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use docksmith_client::error::CoreError;
use serde::Deserialize;
use tokio::sync::Semaphore;

const MANIFEST_ACCEPT: &str = concat!(
  "application/vnd.docker.distribution.manifest.v2+json, ",
  "application/vnd.docker.distribution.manifest.list.v2+json, ",
  "application/vnd.oci.image.manifest.v1+json, ",
  "application/vnd.oci.image.index.v1+json",
);

/// The registry boundary. Auth, rate limiting and transport live
/// here; the resolver only sees tags and digests.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
  /// All tags for the repository. [CoreError::NotFound] means the
  /// image has no remote equivalent.
  async fn list_tags(
    &self,
    image_ref: &str,
  ) -> Result<Vec<String>, CoreError>;

  /// Manifest digest (`sha256:..`) of a tag.
  async fn manifest_digest(
    &self,
    image_ref: &str,
    tag: &str,
    architecture: &str,
  ) -> Result<String, CoreError>;
}

/// An image reference broken into registry + repository.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCoords {
  pub registry: String,
  pub repository: String,
}

/// `nginx` -> docker hub `library/nginx`;
/// `ghcr.io/owner/app` -> ghcr `owner/app`.
pub fn parse_image_ref(image_ref: &str) -> ImageCoords {
  let (repo, _) =
    docksmith_client::entities::split_image_ref(image_ref);
  let segments: Vec<&str> = repo.splitn(2, '/').collect();
  match segments.as_slice() {
    [single] => ImageCoords {
      registry: String::from("registry-1.docker.io"),
      repository: format!("library/{single}"),
    },
    [first, rest] => {
      // A registry host contains '.' or ':' (localhost:5000).
      if first.contains('.') || first.contains(':') {
        ImageCoords {
          registry: first.to_string(),
          repository: rest.to_string(),
        }
      } else {
        ImageCoords {
          registry: String::from("registry-1.docker.io"),
          repository: repo.clone(),
        }
      }
    }
    _ => ImageCoords {
      registry: String::from("registry-1.docker.io"),
      repository: repo.clone(),
    },
  }
}

/// OCI distribution client over HTTP. Token auth for Docker Hub
/// and ghcr; bearer tokens cached per repository.
pub struct HttpRegistry {
  http: reqwest::Client,
  limiter: Semaphore,
  tokens: DashMap<String, String>,
  github_token: Option<String>,
}

impl HttpRegistry {
  pub fn new(
    concurrency: usize,
    github_token: Option<String>,
  ) -> HttpRegistry {
    HttpRegistry {
      http: reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!(
          "docksmith/",
          env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("failed to build registry http client"),
      limiter: Semaphore::new(concurrency.max(1)),
      tokens: DashMap::new(),
      github_token,
    }
  }

  async fn token_for(
    &self,
    coords: &ImageCoords,
  ) -> Result<Option<String>, CoreError> {
    if let Some(token) = self.tokens.get(&coords.repository) {
      return Ok(Some(token.clone()));
    }
    let token = match coords.registry.as_str() {
      "registry-1.docker.io" => {
        let url = format!(
          "https://auth.docker.io/token?service=registry.docker.io\
           &scope=repository:{}:pull",
          coords.repository
        );
        Some(self.fetch_token(&url, None).await?)
      }
      "ghcr.io" => {
        let url = format!(
          "https://ghcr.io/token?service=ghcr.io\
           &scope=repository:{}:pull",
          coords.repository
        );
        // ghcr accepts an (optionally empty) basic credential of
        // the github token for public and private pulls alike.
        let basic = self.github_token.as_ref().map(|token| {
          base64::engine::general_purpose::STANDARD
            .encode(format!("x:{token}"))
        });
        Some(self.fetch_token(&url, basic).await?)
      }
      _ => None,
    };
    if let Some(token) = &token {
      self
        .tokens
        .insert(coords.repository.clone(), token.clone());
    }
    Ok(token)
  }

  async fn fetch_token(
    &self,
    url: &str,
    basic: Option<String>,
  ) -> Result<String, CoreError> {
    #[derive(Deserialize)]
    struct TokenResponse {
      token: String,
    }
    let mut request = self.http.get(url);
    if let Some(basic) = basic {
      request =
        request.header("Authorization", format!("Basic {basic}"));
    }
    let response =
      request.send().await.map_err(CoreError::external)?;
    if !response.status().is_success() {
      return Err(CoreError::External(format!(
        "Token endpoint returned {}",
        response.status()
      )));
    }
    let token: TokenResponse =
      response.json().await.map_err(CoreError::external)?;
    Ok(token.token)
  }

  async fn get(
    &self,
    coords: &ImageCoords,
    path: &str,
    head: bool,
  ) -> Result<reqwest::Response, CoreError> {
    let _permit = self
      .limiter
      .acquire()
      .await
      .map_err(CoreError::external)?;
    let url = format!(
      "https://{}/v2/{}/{path}",
      coords.registry, coords.repository
    );
    let mut request = if head {
      self.http.head(&url)
    } else {
      self.http.get(&url)
    };
    if let Some(token) = self.token_for(coords).await? {
      request = request.bearer_auth(token);
    }
    request = request.header("Accept", MANIFEST_ACCEPT);
    let response =
      request.send().await.map_err(CoreError::external)?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(CoreError::NotFound(format!(
        "{}/{}",
        coords.registry, coords.repository
      )));
    }
    if !response.status().is_success() {
      return Err(CoreError::External(format!(
        "Registry returned {} for {url}",
        response.status()
      )));
    }
    Ok(response)
  }
}

#[async_trait]
impl RegistryAdapter for HttpRegistry {
  async fn list_tags(
    &self,
    image_ref: &str,
  ) -> Result<Vec<String>, CoreError> {
    #[derive(Deserialize)]
    struct TagList {
      #[serde(default)]
      tags: Option<Vec<String>>,
    }
    let coords = parse_image_ref(image_ref);
    let response =
      self.get(&coords, "tags/list?n=1000", false).await?;
    let list: TagList = response
      .json()
      .await
      .context("Failed to parse tag list")
      .map_err(CoreError::external)?;
    Ok(list.tags.unwrap_or_default())
  }

  async fn manifest_digest(
    &self,
    image_ref: &str,
    tag: &str,
    _architecture: &str,
  ) -> Result<String, CoreError> {
    let coords = parse_image_ref(image_ref);
    let response = self
      .get(&coords, &format!("manifests/{tag}"), true)
      .await?;
    response
      .headers()
      .get("Docker-Content-Digest")
      .and_then(|digest| digest.to_str().ok())
      .map(str::to_string)
      .ok_or_else(|| {
        CoreError::External(String::from(
          "Registry response missing Docker-Content-Digest",
        ))
      })
  }
}
