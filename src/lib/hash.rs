//! S3 ETag compatible content hashing.
//!
//! Objects uploaded in a single part carry the hex MD5 of their content as
//! ETag. Multipart uploads carry the MD5 of the concatenated part digests
//! followed by `-<part count>`. Hashing local files the same way lets a
//! download skip files that are already up to date.

use std::io::{self, Read};

use md5::{Digest, Md5};

/// Part size used by the S3 clients when splitting uploads.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Hashes `reader` the way S3 computes ETags, with the default part size.
pub fn md5s3<R: Read>(reader: R) -> io::Result<String> {
  md5s3_with_chunk_size(reader, DEFAULT_CHUNK_SIZE)
}

pub fn md5s3_with_chunk_size<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
  let mut part_digests = Vec::new();
  let mut buffer = vec![0u8; chunk_size.max(1)];

  loop {
    let filled = fill(&mut reader, &mut buffer)?;
    if filled == 0 && !part_digests.is_empty() {
      break;
    }
    part_digests.push(Md5::digest(&buffer[..filled]));
    if filled < buffer.len() {
      break;
    }
  }

  if part_digests.len() == 1 {
    return Ok(hex::encode(part_digests[0]));
  }

  let mut hasher = Md5::new();
  for digest in &part_digests {
    hasher.update(digest);
  }
  Ok(format!(
    "{}-{}",
    hex::encode(hasher.finalize()),
    part_digests.len()
  ))
}

/// Whether the content of `reader` matches `etag`. An ETag without a
/// `-<part count>` suffix was stored in a single part and is compared against
/// the plain MD5, however large the content is.
pub fn matches_etag<R: Read>(reader: R, etag: &str) -> io::Result<bool> {
  matches_etag_with_chunk_size(reader, etag, DEFAULT_CHUNK_SIZE)
}

fn matches_etag_with_chunk_size<R: Read>(
  mut reader: R,
  etag: &str,
  chunk_size: usize,
) -> io::Result<bool> {
  if is_multipart(etag) {
    return Ok(md5s3_with_chunk_size(reader, chunk_size)? == etag);
  }

  let mut hasher = Md5::new();
  io::copy(&mut reader, &mut hasher)?;
  Ok(hex::encode(hasher.finalize()) == etag)
}

fn is_multipart(etag: &str) -> bool {
  etag
    .rsplit_once('-')
    .is_some_and(|(_, parts)| !parts.is_empty() && parts.bytes().all(|b| b.is_ascii_digit()))
}

/// Reads until `buffer` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
  let mut filled = 0;
  while filled < buffer.len() {
    match reader.read(&mut buffer[filled..]) {
      Ok(0) => break,
      Ok(n) => filled += n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    }
  }
  Ok(filled)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_part_is_plain_md5() {
    assert_eq!(
      md5s3(&b"hello world"[..]).unwrap(),
      "5eb63bbbe01eeed093cb22bb8f5acdc3"
    );
    assert_eq!(md5s3(&b""[..]).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
  }

  #[test]
  fn test_multipart_etag() {
    let data = b"aaaabbbbcc";
    let expected = {
      let mut hasher = Md5::new();
      hasher.update(Md5::digest(b"aaaa"));
      hasher.update(Md5::digest(b"bbbb"));
      hasher.update(Md5::digest(b"cc"));
      format!("{}-3", hex::encode(hasher.finalize()))
    };
    assert_eq!(md5s3_with_chunk_size(&data[..], 4).unwrap(), expected);
  }

  #[test]
  fn test_exact_chunk_multiple_has_no_empty_part() {
    let etag = md5s3_with_chunk_size(&b"aaaabbbb"[..], 4).unwrap();
    assert!(etag.ends_with("-2"));
    assert_eq!(md5s3_with_chunk_size(&b"aaaa"[..], 4).unwrap(), hex::encode(Md5::digest(b"aaaa")));
  }

  #[test]
  fn test_matches_etag_by_form() {
    let data = b"aaaabbbbcc";
    let plain = hex::encode(Md5::digest(data));
    let multipart = md5s3_with_chunk_size(&data[..], 4).unwrap();

    // Content above the part size stored with a single put.
    assert!(matches_etag_with_chunk_size(&data[..], &plain, 4).unwrap());
    assert!(matches_etag_with_chunk_size(&data[..], &multipart, 4).unwrap());
    assert!(!matches_etag_with_chunk_size(&b"aaaabbbbcd"[..], &plain, 4).unwrap());
    assert!(!matches_etag_with_chunk_size(&b"aaaabbbbcd"[..], &multipart, 4).unwrap());
  }

  #[test]
  fn test_matches_etag_default_chunk_size() {
    assert!(matches_etag(&b"hello world"[..], "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap());
    assert!(!matches_etag(&b"hello"[..], "5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap());
  }
}
