//! Request decoding and response encoding
//!
//! A connection carries one JSON request document from the client and, after
//! processing, one JSON response array followed by a newline. File contents
//! in the request are gzip-compressed and base64-encoded.

use crate::result::Response;
use crate::{BorError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::io::{BufReader, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Name of the generated build script
pub const MAKEFILE: &str = "Makefile";
/// Object stem of the harness linked into every suite
pub const HARNESS_STEM: &str = "TAPListener";
/// File name the harness source is staged under
pub const HARNESS_SOURCE: &str = "TAPListener.cpp";
/// Extensions `make` compiles into objects
pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "C"];
/// Largest decompressed size of a single file
pub const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024; // 64MB

/// Decoded contents of a submitted file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileContent(Vec<u8>);

impl FileContent {
    #[must_use]
    pub const fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Decode a base64 string of gzip data
    pub fn decode(encoded: &str) -> std::result::Result<Self, String> {
        let compressed = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("invalid base64: {e}"))?;

        let mut bytes = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .take(MAX_FILE_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| format!("invalid gzip data: {e}"))?;
        if bytes.len() as u64 > MAX_FILE_BYTES {
            return Err(format!("file exceeds {MAX_FILE_BYTES} bytes"));
        }
        Ok(Self(bytes))
    }

    /// Gzip and base64 encode the contents
    pub fn encode(&self) -> std::io::Result<String> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.0)?;
        Ok(STANDARD.encode(encoder.finish()?))
    }
}

impl<'de> Deserialize<'de> for FileContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FileContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = self.encode().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }
}

/// One executable to link: `name` from the harness and the `link` modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub name: String,
    pub link: Vec<String>,
}

impl SuiteSpec {
    pub fn new<I, S>(name: impl Into<String>, link: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            link: link.into_iter().map(Into::into).collect(),
        }
    }
}

/// A build-and-test job as submitted by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub files: BTreeMap<String, FileContent>,
    #[serde(default)]
    pub suites: Vec<SuiteSpec>,
}

impl BuildRequest {
    /// Check names before anything touches the filesystem or the Makefile
    pub fn validate(&self) -> Result<()> {
        let mut modules = HashSet::new();
        for name in self.files.keys() {
            if !is_safe_name(name) {
                return Err(invalid(format!("invalid file name {name:?}")));
            }
            if name == MAKEFILE || name == HARNESS_SOURCE {
                return Err(invalid(format!("file name {name:?} is reserved")));
            }
            if let Some(stem) = source_stem(name) {
                modules.insert(stem);
            }
        }

        let mut suites = HashSet::new();
        for suite in &self.suites {
            let name = suite.name.as_str();
            if !is_target_name(name) {
                return Err(invalid(format!("invalid suite name {name:?}")));
            }
            let reserved = ["all", MAKEFILE, HARNESS_STEM];
            if reserved.contains(&name) || self.files.contains_key(name) {
                return Err(invalid(format!("suite name {name:?} is reserved")));
            }
            if !suites.insert(name) {
                return Err(invalid(format!("duplicate suite {name:?}")));
            }
            if suite.link.is_empty() {
                return Err(invalid(format!("suite {name:?} links no modules")));
            }
            if let Some(missing) = suite.link.iter().find(|m| !modules.contains(m.as_str())) {
                return Err(invalid(format!(
                    "suite {name:?} links {missing:?}, which has no source file"
                )));
            }
        }
        Ok(())
    }
}

fn invalid(msg: String) -> BorError {
    BorError::InvalidRequest(msg)
}

/// Plain file name usable unquoted in a Makefile
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
}

fn is_target_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Module name of a compilable source file
fn source_stem(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext)).then_some(stem)
}


/// Read exactly one request document from `stream`
///
/// Bytes after the document are left unread. The read is bounded by
/// `max_bytes` in total and by `read_timeout` per blocking read. The
/// connection is handed back for the response only if decoding succeeded.
pub async fn read_request(
    stream: TcpStream,
    max_bytes: u64,
    read_timeout: Duration,
) -> Result<(BuildRequest, TcpStream)> {
    let std_stream = stream.into_std()?;

    // A failed read drops the stream on the blocking pool as well
    let (std_stream, request) = tokio::task::spawn_blocking(move || {
        decode_blocking(&std_stream, max_bytes, read_timeout).map(|req| (std_stream, req))
    })
    .await
    .map_err(|e| BorError::Io(std::io::Error::other(e)))??;

    std_stream.set_nonblocking(true)?;
    Ok((request, TcpStream::from_std(std_stream)?))
}

fn decode_blocking(
    stream: &std::net::TcpStream,
    max_bytes: u64,
    read_timeout: Duration,
) -> Result<BuildRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;

    let reader = BufReader::new(stream.take(max_bytes));
    let mut de = serde_json::Deserializer::from_reader(reader);
    BuildRequest::deserialize(&mut de).map_err(|e| BorError::Protocol(e.to_string()))
}

/// Write the response array and a trailing newline, then close the write side
pub async fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let mut body = serde_json::to_vec(response)?;
    body.push(b'\n');
    stream.write_all(&body).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Send `request` to a daemon at `addr` and wait for its response
pub async fn submit(addr: impl ToSocketAddrs, request: &BuildRequest) -> Result<Response> {
    let mut stream = TcpStream::connect(addr).await?;
    let body = serde_json::to_vec(request)?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    if reply.is_empty() {
        return Err(BorError::Protocol(
            "connection closed without a response".into(),
        ));
    }
    Ok(serde_json::from_slice(&reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn gz64(data: &[u8]) -> String {
        FileContent::from_bytes(data.to_vec()).encode().unwrap()
    }

    fn request(files: &[(&str, &str)], suites: Vec<SuiteSpec>) -> BuildRequest {
        BuildRequest {
            files: files
                .iter()
                .map(|(n, c)| ((*n).to_string(), FileContent::from_bytes(c.as_bytes().to_vec())))
                .collect(),
            suites,
        }
    }

    #[test]
    fn decodes_gzip_base64_payload() {
        let source = b"int add(int a, int b) { return a + b; }\n";
        let text = json!({
            "files": {"add.cpp": gz64(source)},
            "suites": [{"name": "test_add", "link": ["add"]}]
        })
        .to_string();

        let req: BuildRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(req.files["add.cpp"].as_bytes(), source);
        assert_eq!(req.suites, vec![SuiteSpec::new("test_add", ["add"])]);
        req.validate().unwrap();
    }

    #[test]
    fn rejects_bad_payloads() {
        let text = json!({"files": {"a.cpp": "%%%"}}).to_string();
        let err = serde_json::from_str::<BuildRequest>(&text).unwrap_err();
        assert!(err.to_string().contains("invalid base64"));

        // valid base64, but not gzip
        let text = json!({"files": {"a.cpp": STANDARD.encode(b"plain text")}}).to_string();
        let err = serde_json::from_str::<BuildRequest>(&text).unwrap_err();
        assert!(err.to_string().contains("invalid gzip"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let req: BuildRequest = serde_json::from_str("{}").unwrap();
        assert!(req.files.is_empty());
        assert!(req.suites.is_empty());
        req.validate().unwrap();
    }

    #[test]
    fn validation() {
        let ok = request(&[("a.cpp", ""), ("a.h", "")], vec![SuiteSpec::new("t", ["a"])]);
        ok.validate().unwrap();

        let cases = [
            request(&[("../a.cpp", "")], vec![]),
            request(&[("dir/a.cpp", "")], vec![]),
            request(&[("a b.cpp", "")], vec![]),
            request(&[("Makefile", "")], vec![]),
            request(&[("TAPListener.cpp", "")], vec![]),
            request(&[("a.cpp", "")], vec![SuiteSpec::new("all", ["a"])]),
            request(&[("a.cpp", "")], vec![SuiteSpec::new("Makefile", ["a"])]),
            request(&[("a.cpp", "")], vec![SuiteSpec::new("a.cpp", ["a"])]),
            request(&[("a.cpp", "")], vec![SuiteSpec::new("$(shell id)", ["a"])]),
            request(&[("a.cpp", "")], vec![SuiteSpec::new("t", Vec::<String>::new())]),
            request(&[("a.h", "")], vec![SuiteSpec::new("t", ["a"])]),
            request(
                &[("a.cpp", "")],
                vec![SuiteSpec::new("t", ["a"]), SuiteSpec::new("t", ["a"])],
            ),
        ];
        for req in cases {
            let err = req.validate().unwrap_err();
            assert!(matches!(err, BorError::InvalidRequest(_)), "{req:?}");
        }
    }

    #[tokio::test]
    async fn reads_one_document_and_responds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (req, mut stream) =
                read_request(stream, 1 << 20, Duration::from_secs(5)).await.unwrap();
            let response: Response = req
                .suites
                .iter()
                .map(|s| crate::SuiteReport::failed(&s.name, Default::default(), "nope", b""))
                .collect();
            write_response(&mut stream, &response).await.unwrap();
        });

        let req = request(&[("a.cpp", "int x;")], vec![SuiteSpec::new("t", ["a"])]);
        let response = submit(addr, &req).await.unwrap();
        server.await.unwrap();

        assert_eq!(response.len(), 1);
        assert_eq!(response[0].name, "t");
        assert_eq!(response[0].error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn malformed_document_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"{\"files\": [1, 2").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = read_request(stream, 1 << 20, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BorError::Protocol(_)));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_document_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let body = json!({"files": {"a.cpp": gz64(&[b'x'; 4096])}, "suites": []});
            stream.write_all(body.to_string().as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = read_request(stream, 16, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BorError::Protocol(_)));
        client.await.unwrap();
    }
}
