//! `s3://bucket/key` backend on top of the AWS SDK.
//!
//! The SDK is async; [`S3Storage`] owns a current-thread runtime and blocks on
//! each request so the rest of the crate stays synchronous.

use std::io::{Read, Write};

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Object};
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};

#[cfg(feature = "tracing")]
use tracing::{debug, trace, warn};

use super::{RemoteObject, S3_SCHEME, SCHEME_SEPARATOR, Storage, StorageError};
use crate::hash::DEFAULT_CHUNK_SIZE;
use crate::mapping::{is_prefix, strip_prefix};
use crate::settings::Settings;

const CREDENTIALS_PROVIDER_NAME: &str = "s3conf-settings";

/// Connection options resolved from settings. Anything left unset falls back
/// to the AWS SDK default chain.
#[derive(Clone, Default)]
pub struct S3Options {
  pub region: Option<String>,
  /// Custom endpoint for S3-compatible stores. Implies path-style addressing.
  pub endpoint_url: Option<String>,
  pub access_key_id: Option<String>,
  pub secret_access_key: Option<String>,
  pub session_token: Option<String>,
}

impl S3Options {
  pub fn from_settings(settings: &Settings) -> Self {
    let get = |key: &str| settings.get(key).map(str::to_string);
    Self {
      region: get("AWS_DEFAULT_REGION").or_else(|| get("AWS_REGION")),
      endpoint_url: get("AWS_S3_ENDPOINT_URL"),
      access_key_id: get("AWS_ACCESS_KEY_ID"),
      secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
      session_token: get("AWS_SESSION_TOKEN"),
    }
  }

  fn credentials(&self) -> Option<Credentials> {
    match (&self.access_key_id, &self.secret_access_key) {
      (Some(id), Some(secret)) => Some(Credentials::new(
        id,
        secret,
        self.session_token.clone(),
        None,
        CREDENTIALS_PROVIDER_NAME,
      )),
      _ => None,
    }
  }
}

pub struct S3Storage {
  client: Client,
  runtime: Runtime,
}

impl S3Storage {
  pub fn new(options: S3Options) -> Result<Self, StorageError> {
    let runtime = RuntimeBuilder::new_current_thread()
      .enable_all()
      .build()
      .map_err(StorageError::Runtime)?;

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = options.region.clone() {
      loader = loader.region(Region::new(region));
    }
    if let Some(credentials) = options.credentials() {
      loader = loader.credentials_provider(credentials);
    }
    let sdk_config = runtime.block_on(loader.load());

    let mut builder = S3ConfigBuilder::from(&sdk_config);
    if let Some(endpoint) = &options.endpoint_url {
      #[cfg(feature = "tracing")]
      debug!(%endpoint, "Using custom S3 endpoint");
      builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    Ok(Self {
      client: Client::from_conf(builder.build()),
      runtime,
    })
  }

  async fn put(&self, bucket: &str, key: &str, path: &str, body: Vec<u8>) -> Result<(), StorageError> {
    self
      .client
      .put_object()
      .bucket(bucket)
      .key(key)
      .body(ByteStream::from(body))
      .send()
      .await
      .map_err(|e| s3_error(path, e))?;
    Ok(())
  }

  /// Uploads `parts` followed by the rest of `reader` as a multipart upload,
  /// one part per [`DEFAULT_CHUNK_SIZE`] so the ETag matches
  /// [`md5s3`](crate::hash::md5s3). The upload is aborted on failure.
  async fn put_multipart(
    &self,
    bucket: &str,
    key: &str,
    path: &str,
    parts: Vec<Vec<u8>>,
    reader: &mut dyn Read,
  ) -> Result<(), StorageError> {
    let upload = self
      .client
      .create_multipart_upload()
      .bucket(bucket)
      .key(key)
      .send()
      .await
      .map_err(|e| s3_error(path, e))?;
    let upload_id = upload
      .upload_id()
      .ok_or_else(|| StorageError::S3 {
        path: path.to_string(),
        message: "no upload id in response".to_string(),
      })?
      .to_string();

    let result = self
      .upload_parts(bucket, key, path, &upload_id, parts, reader)
      .await;

    if result.is_err() {
      #[cfg(feature = "tracing")]
      warn!(bucket, key, "Aborting multipart upload");

      let _ = self
        .client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(&upload_id)
        .send()
        .await;
    }
    result
  }

  async fn upload_parts(
    &self,
    bucket: &str,
    key: &str,
    path: &str,
    upload_id: &str,
    parts: Vec<Vec<u8>>,
    reader: &mut dyn Read,
  ) -> Result<(), StorageError> {
    let mut pending = parts.into_iter();
    let mut completed = Vec::new();

    loop {
      let chunk = match pending.next() {
        Some(chunk) => chunk,
        None => read_part(reader, path)?,
      };
      if chunk.is_empty() {
        break;
      }

      let part_number = completed.len() as i32 + 1;

      #[cfg(feature = "tracing")]
      trace!(part_number, bytes = chunk.len(), "Uploading part");

      let output = self
        .client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .part_number(part_number)
        .body(ByteStream::from(chunk))
        .send()
        .await
        .map_err(|e| s3_error(path, e))?;

      completed.push(
        CompletedPart::builder()
          .set_e_tag(output.e_tag().map(str::to_string))
          .part_number(part_number)
          .build(),
      );
    }

    self
      .client
      .complete_multipart_upload()
      .bucket(bucket)
      .key(key)
      .upload_id(upload_id)
      .multipart_upload(
        CompletedMultipartUpload::builder()
          .set_parts(Some(completed))
          .build(),
      )
      .send()
      .await
      .map_err(|e| s3_error(path, e))?;
    Ok(())
  }
}

impl Storage for S3Storage {
  fn list(&self, path: &str) -> Result<Vec<RemoteObject>, StorageError> {
    let (bucket, prefix) = parse_url(path)?;

    #[cfg(feature = "tracing")]
    debug!(bucket, prefix, "Listing S3 objects");

    self.runtime.block_on(async {
      let mut objects = Vec::new();
      let mut pages = self
        .client
        .list_objects_v2()
        .bucket(bucket)
        .prefix(prefix)
        .into_paginator()
        .send();

      while let Some(page) = pages.next().await {
        let page = page.map_err(|e| s3_error(path, e))?;
        objects.extend(remote_objects(page.contents(), prefix));
      }

      #[cfg(feature = "tracing")]
      trace!("Listed {} objects under {}", objects.len(), path);

      Ok::<_, StorageError>(objects)
    })
  }

  fn read_into(&self, path: &str, writer: &mut dyn Write) -> Result<u64, StorageError> {
    let (bucket, key) = parse_url(path)?;

    self.runtime.block_on(async {
      let output = self
        .client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| get_object_error(path, e))?;

      let mut body = output.body;
      let mut copied = 0u64;
      while let Some(chunk) = body.try_next().await.map_err(|e| s3_error(path, e))? {
        writer
          .write_all(&chunk)
          .map_err(|e| StorageError::io(path, e))?;
        copied += chunk.len() as u64;
      }
      Ok::<_, StorageError>(copied)
    })
  }

  fn write(&self, reader: &mut dyn Read, path: &str) -> Result<(), StorageError> {
    let (bucket, key) = parse_url(path)?;

    let first = read_part(reader, path)?;
    let second = if first.len() < DEFAULT_CHUNK_SIZE {
      Vec::new()
    } else {
      read_part(reader, path)?
    };

    #[cfg(feature = "tracing")]
    debug!(bucket, key, multipart = !second.is_empty(), "Uploading S3 object");

    self.runtime.block_on(async move {
      if second.is_empty() {
        self.put(bucket, key, path, first).await
      } else {
        self
          .put_multipart(bucket, key, path, vec![first, second], reader)
          .await
      }
    })
  }
}

/// Keeps the listed objects that [`Storage::list`] reports for `prefix`: every
/// file below a prefix ending in `/`, otherwise only the exact key.
fn remote_objects(contents: &[Object], prefix: &str) -> Vec<RemoteObject> {
  let listing_prefix = is_prefix(prefix);

  contents
    .iter()
    .filter_map(|object| {
      let key = object.key()?;
      let path = if listing_prefix {
        // Zero-byte "directory" markers are not files.
        if key.ends_with('/') {
          return None;
        }
        strip_prefix(key, prefix).to_string()
      } else if key == prefix {
        String::new()
      } else {
        return None;
      };

      Some(RemoteObject {
        md5: object.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        path,
      })
    })
    .collect()
}

/// Reads up to one upload part from `reader`.
fn read_part(reader: &mut dyn Read, path: &str) -> Result<Vec<u8>, StorageError> {
  let mut part = Vec::new();
  reader
    .take(DEFAULT_CHUNK_SIZE as u64)
    .read_to_end(&mut part)
    .map_err(|e| StorageError::io(path, e))?;
  Ok(part)
}

fn get_object_error<R>(path: &str, err: SdkError<GetObjectError, R>) -> StorageError
where
  R: std::fmt::Debug,
{
  if err.as_service_error().is_some_and(GetObjectError::is_no_such_key) {
    StorageError::NotFound(path.to_string())
  } else {
    s3_error(path, err)
  }
}

/// Splits `s3://bucket/key` into `(bucket, key)`.
fn parse_url(path: &str) -> Result<(&str, &str), StorageError> {
  let rest = path
    .strip_prefix(S3_SCHEME)
    .and_then(|rest| rest.strip_prefix(SCHEME_SEPARATOR))
    .ok_or_else(|| StorageError::InvalidUrl(path.to_string()))?;

  let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
  if bucket.is_empty() {
    return Err(StorageError::InvalidUrl(path.to_string()));
  }
  Ok((bucket, key))
}

fn s3_error<E: std::error::Error>(path: &str, err: E) -> StorageError {
  StorageError::S3 {
    path: path.to_string(),
    message: DisplayErrorContext(err).to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use aws_sdk_s3::error::ErrorMetadata;
  use aws_sdk_s3::types::error::NoSuchKey;

  #[test]
  fn test_parse_url() {
    assert_eq!(parse_url("s3://bucket/dir/file.env").unwrap(), ("bucket", "dir/file.env"));
    assert_eq!(parse_url("s3://bucket/dir/").unwrap(), ("bucket", "dir/"));
    assert_eq!(parse_url("s3://bucket").unwrap(), ("bucket", ""));
    assert!(matches!(parse_url("s3:///key"), Err(StorageError::InvalidUrl(_))));
    assert!(matches!(parse_url("/local/path"), Err(StorageError::InvalidUrl(_))));
  }

  #[test]
  fn test_options_from_settings() {
    let settings = Settings::from_iter([
      ("AWS_REGION", "eu-west-1"),
      ("AWS_S3_ENDPOINT_URL", "http://localhost:9000"),
      ("AWS_ACCESS_KEY_ID", "id"),
      ("AWS_SECRET_ACCESS_KEY", "secret"),
    ]);
    let options = S3Options::from_settings(&settings);

    assert_eq!(options.region.as_deref(), Some("eu-west-1"));
    assert_eq!(options.endpoint_url.as_deref(), Some("http://localhost:9000"));
    assert!(options.credentials().is_some());
  }

  #[test]
  fn test_credentials_need_both_keys() {
    let options = S3Options {
      access_key_id: Some("id".to_string()),
      ..S3Options::default()
    };
    assert!(options.credentials().is_none());
  }

  fn object(key: &str, e_tag: &str) -> Object {
    Object::builder().key(key).e_tag(e_tag).build()
  }

  #[test]
  fn test_remote_objects_under_prefix() {
    let contents = [
      object("dev/files/", "\"d41d8cd98f00b204e9800998ecf8427e\""),
      object("dev/files/app.conf", "\"0cc175b9c0f1b6a831c399e269772661\""),
      object("dev/files/nested/db.conf", "\"abc-2\""),
    ];

    assert_eq!(
      remote_objects(&contents, "dev/files/"),
      vec![
        RemoteObject {
          md5: "0cc175b9c0f1b6a831c399e269772661".to_string(),
          path: "app.conf".to_string(),
        },
        RemoteObject {
          md5: "abc-2".to_string(),
          path: "nested/db.conf".to_string(),
        },
      ]
    );
  }

  #[test]
  fn test_remote_objects_exact_key_only() {
    let contents = [
      object("dev/dir", "\"one\""),
      object("dev/dirty", "\"two\""),
      object("dev/dir/inner", "\"three\""),
    ];

    assert_eq!(
      remote_objects(&contents, "dev/dir"),
      vec![RemoteObject {
        md5: "one".to_string(),
        path: String::new(),
      }]
    );
    assert!(remote_objects(&contents, "dev/missing").is_empty());
  }

  #[test]
  fn test_missing_key_is_not_found() {
    let no_such_key = GetObjectError::NoSuchKey(NoSuchKey::builder().build());
    let missing = SdkError::service_error(no_such_key, ());
    match get_object_error("s3://bucket/key", missing) {
      StorageError::NotFound(path) => assert_eq!(path, "s3://bucket/key"),
      other => panic!("Expected NotFound, got {:?}", other),
    }

    let access_denied = ErrorMetadata::builder().code("AccessDenied").build();
    let denied = SdkError::service_error(GetObjectError::generic(access_denied), ());
    assert!(matches!(
      get_object_error("s3://bucket/key", denied),
      StorageError::S3 { .. }
    ));
  }

  #[test]
  fn test_read_part_stops_at_part_size() {
    let data = vec![7u8; DEFAULT_CHUNK_SIZE + 3];
    let mut reader = &data[..];

    assert_eq!(read_part(&mut reader, "x").unwrap().len(), DEFAULT_CHUNK_SIZE);
    assert_eq!(read_part(&mut reader, "x").unwrap().len(), 3);
    assert!(read_part(&mut reader, "x").unwrap().is_empty());
  }
}
