//! containerd gRPC client
//!
//! A thin client over the containerd content, images, and leases
//! services, speaking gRPC across the daemon's Unix socket. The message
//! types are hand-declared prost structs for exactly the fields we use;
//! field numbers follow the containerd API protos. All requests carry
//! the `containerd-namespace` header (default `moby`) and, while blobs
//! move, a `containerd-lease` header so the garbage collector leaves
//! half-imported content alone.

use crate::error::{ImageError, Result};
use crate::logging::Logger;
use futures_util::StreamExt;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub const DEFAULT_NAMESPACE: &str = "moby";
pub const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";
/// Maximum lease age; containerd reclaims the lease after this
const LEASE_EXPIRY_SECS: i64 = 3600;
const WRITE_CHUNK_SIZE: usize = 1024 * 1024;

// -- containerd.types --

#[derive(Clone, PartialEq, prost::Message)]
pub struct Descriptor {
    #[prost(string, tag = "1")]
    pub media_type: String,
    #[prost(string, tag = "2")]
    pub digest: String,
    #[prost(int64, tag = "3")]
    pub size: i64,
    #[prost(map = "string, string", tag = "5")]
    pub annotations: std::collections::HashMap<String, String>,
}

// -- containerd.services.leases.v1 --

#[derive(Clone, PartialEq, prost::Message)]
pub struct Lease {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub created_at: Option<prost_types::Timestamp>,
    #[prost(map = "string, string", tag = "3")]
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateLeaseRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(map = "string, string", tag = "3")]
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateLeaseResponse {
    #[prost(message, optional, tag = "1")]
    pub lease: Option<Lease>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteLeaseRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub sync: bool,
}

/// `google.protobuf.Empty`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

// -- containerd.services.content.v1 --

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRequest {
    #[prost(string, tag = "1")]
    pub digest: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContentInfo {
    #[prost(string, tag = "1")]
    pub digest: String,
    #[prost(int64, tag = "2")]
    pub size: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoResponse {
    #[prost(message, optional, tag = "1")]
    pub info: Option<ContentInfo>,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Enumeration, Debug)]
#[repr(i32)]
pub enum WriteAction {
    Stat = 0,
    Write = 1,
    Commit = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteContentRequest {
    #[prost(enumeration = "WriteAction", tag = "1")]
    pub action: i32,
    #[prost(string, tag = "2")]
    pub r#ref: String,
    #[prost(int64, tag = "3")]
    pub total: i64,
    #[prost(string, tag = "4")]
    pub expected: String,
    #[prost(int64, tag = "5")]
    pub offset: i64,
    #[prost(bytes = "vec", tag = "6")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteContentResponse {
    #[prost(enumeration = "WriteAction", tag = "1")]
    pub action: i32,
    #[prost(int64, tag = "4")]
    pub offset: i64,
    #[prost(int64, tag = "5")]
    pub total: i64,
    #[prost(string, tag = "6")]
    pub digest: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AbortRequest {
    #[prost(string, tag = "1")]
    pub r#ref: String,
}

// -- containerd.services.images.v1 --

#[derive(Clone, PartialEq, prost::Message)]
pub struct Image {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: std::collections::HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub target: Option<Descriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateImageRequest {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CreateImageResponse {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateImageRequest {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
    #[prost(message, optional, tag = "2")]
    pub update_mask: Option<prost_types::FieldMask>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UpdateImageResponse {
    #[prost(message, optional, tag = "1")]
    pub image: Option<Image>,
}

fn daemon_error(context: &str, status: tonic::Status) -> ImageError {
    ImageError::Daemon(format!("containerd {}: {}", context, status))
}

/// Is a containerd socket reachable at the default (or overridden)
/// path?
pub fn socket_path() -> PathBuf {
    std::env::var("CONTAINERD_ADDRESS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET))
}

pub fn socket_reachable(path: &Path) -> bool {
    path.exists()
}

pub struct ContainerdClient {
    grpc: tonic::client::Grpc<Channel>,
    namespace: String,
    lease_id: Option<String>,
    logger: Logger,
}

impl ContainerdClient {
    /// Connect over the Unix socket
    pub async fn connect(socket: &Path, namespace: &str, logger: Logger) -> Result<Self> {
        let socket = socket.to_path_buf();
        // The URI is ignored; the connector always dials the socket.
        let channel = Endpoint::try_from("http://[::1]:50051")
            .map_err(|e| ImageError::Daemon(format!("containerd endpoint: {}", e)))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?))
                }
            }))
            .await
            .map_err(|e| ImageError::Daemon(format!("containerd connect: {}", e)))?;
        Ok(Self {
            grpc: tonic::client::Grpc::new(channel),
            namespace: namespace.to_string(),
            lease_id: None,
            logger,
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(
            "containerd-namespace",
            self.namespace.parse().expect("namespace is ascii"),
        );
        if let Some(lease) = &self.lease_id {
            metadata.insert("containerd-lease", lease.parse().expect("lease id is ascii"));
        }
        request
    }

    async fn unary<Req, Resp>(&mut self, path: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.grpc
            .ready()
            .await
            .map_err(|e| ImageError::Daemon(format!("containerd channel: {}", e)))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let request = self.request(message);
        let response = self
            .grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map_err(|status| daemon_error(path, status))?;
        Ok(response.into_inner())
    }

    /// Create a lease (max age one hour) guarding content while it is
    /// imported
    pub async fn create_lease(&mut self) -> Result<String> {
        let id = format!("image-load-{}", uuid::Uuid::new_v4());
        let expiry = chrono::Utc::now() + chrono::Duration::seconds(LEASE_EXPIRY_SECS);
        let mut labels = std::collections::HashMap::new();
        labels.insert(
            "containerd.io/gc.expire".to_string(),
            expiry.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        let response: CreateLeaseResponse = self
            .unary(
                "/containerd.services.leases.v1.Leases/Create",
                CreateLeaseRequest {
                    id: id.clone(),
                    labels,
                },
            )
            .await?;
        let id = response.lease.map(|l| l.id).unwrap_or(id);
        self.lease_id = Some(id.clone());
        self.logger.detail(&format!("Created lease {}", id));
        Ok(id)
    }

    pub async fn delete_lease(&mut self) -> Result<()> {
        if let Some(id) = self.lease_id.take() {
            let result = self
                .unary::<DeleteLeaseRequest, Empty>(
                    "/containerd.services.leases.v1.Leases/Delete",
                    DeleteLeaseRequest { id, sync: false },
                )
                .await;
            if let Err(e) = result {
                // Lease expiry makes deletion best-effort.
                self.logger.detail(&format!("Lease delete: {}", e));
            }
        }
        Ok(())
    }

    /// Drop the daemon's partial state for a failed write. Best-effort:
    /// the lease expiry cleans up anything an abort misses.
    async fn abort_write(&mut self, reference: String) {
        let result = self
            .unary::<AbortRequest, Empty>(
                "/containerd.services.content.v1.Content/Abort",
                AbortRequest { r#ref: reference },
            )
            .await;
        if let Err(e) = result {
            self.logger.detail(&format!("Write abort: {}", e));
        }
    }

    /// Does the content store already hold this digest?
    pub async fn has_content(&mut self, digest: &str) -> Result<bool> {
        match self
            .unary::<InfoRequest, InfoResponse>(
                "/containerd.services.content.v1.Content/Info",
                InfoRequest {
                    digest: digest.to_string(),
                },
            )
            .await
        {
            Ok(response) => Ok(response.info.is_some()),
            Err(ImageError::Daemon(message)) if message.contains("NotFound") => Ok(false),
            Err(e) => {
                if e.to_string().contains("not found") {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Send a prepared write-request stream and drain the responses,
    /// returning the digest carried by the commit acknowledgement
    async fn drive_write<S>(&mut self, messages: S) -> Result<Option<String>>
    where
        S: futures::Stream<Item = WriteContentRequest> + Send + 'static,
    {
        self.grpc
            .ready()
            .await
            .map_err(|e| ImageError::Daemon(format!("containerd channel: {}", e)))?;
        let codec: ProstCodec<WriteContentRequest, WriteContentResponse> = ProstCodec::default();
        let request = self.request(messages);
        let response = self
            .grpc
            .streaming(
                request,
                PathAndQuery::from_static("/containerd.services.content.v1.Content/Write"),
                codec,
            )
            .await
            .map_err(|status| daemon_error("content write", status))?;
        let mut inbound = response.into_inner();
        let mut committed = None;
        while let Some(message) = inbound.next().await {
            let message = message.map_err(|status| daemon_error("content write", status))?;
            if message.action == WriteAction::Commit as i32 {
                committed = Some(message.digest);
            }
        }
        Ok(committed)
    }

    /// Stream one blob into the content store and commit it under its
    /// expected digest. Existing content is a no-op.
    pub async fn write_content(&mut self, digest: &str, data: &[u8]) -> Result<()> {
        if self.has_content(digest).await? {
            self.logger
                .detail(&format!("Content {} already present", digest));
            return Ok(());
        }

        let reference = format!("image-load-{}", uuid::Uuid::new_v4());
        let total = data.len() as i64;
        let mut messages = Vec::with_capacity(data.len() / WRITE_CHUNK_SIZE + 2);
        let mut offset = 0i64;
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            messages.push(WriteContentRequest {
                action: WriteAction::Write as i32,
                r#ref: reference.clone(),
                total,
                expected: String::new(),
                offset,
                data: chunk.to_vec(),
            });
            offset += chunk.len() as i64;
        }
        messages.push(WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: reference.clone(),
            total,
            expected: digest.to_string(),
            offset,
            data: Vec::new(),
        });

        let committed = match self.drive_write(futures::stream::iter(messages)).await {
            Ok(committed) => committed,
            Err(e) => {
                self.abort_write(reference).await;
                return Err(e);
            }
        };
        match committed {
            Some(committed) if committed == digest || committed.is_empty() => Ok(()),
            Some(committed) => Err(ImageError::Daemon(format!(
                "containerd committed {} but {} was expected",
                committed, digest
            ))),
            None => Err(ImageError::Daemon(format!(
                "containerd closed the write stream for {} without a commit",
                digest
            ))),
        }
    }

    /// Stream a blob file into the content store with backpressure from
    /// the gRPC channel; the commit message carries the expected digest.
    pub async fn write_content_file(&mut self, digest: &str, path: &Path) -> Result<()> {
        if self.has_content(digest).await? {
            self.logger
                .detail(&format!("Content {} already present", digest));
            return Ok(());
        }

        let total = std::fs::metadata(path)
            .map_err(|e| ImageError::Io(format!("Failed to stat {}: {}", path.display(), e)))?
            .len() as i64;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ImageError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
        let reference = format!("image-load-{}", uuid::Uuid::new_v4());

        let data_ref = reference.clone();
        let data_stream = tokio_util::io::ReaderStream::with_capacity(file, WRITE_CHUNK_SIZE)
            .scan(0i64, move |offset, chunk| {
                let message = chunk.ok().map(|data| {
                    let message = WriteContentRequest {
                        action: WriteAction::Write as i32,
                        r#ref: data_ref.clone(),
                        total,
                        expected: String::new(),
                        offset: *offset,
                        data: data.to_vec(),
                    };
                    *offset += data.len() as i64;
                    message
                });
                futures::future::ready(message)
            });
        let commit = WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: reference.clone(),
            total,
            expected: digest.to_string(),
            offset: total,
            data: Vec::new(),
        };
        let stream = data_stream.chain(futures::stream::iter(vec![commit]));

        if let Err(e) = self.drive_write(stream).await {
            self.abort_write(reference).await;
            return Err(e);
        }
        self.logger
            .detail(&format!("Wrote content {} ({} bytes)", digest, total));
        Ok(())
    }

    /// Create or update one image entry pointing at the root descriptor
    pub async fn set_image(&mut self, name: &str, target: Descriptor) -> Result<()> {
        let image = Image {
            name: name.to_string(),
            labels: std::collections::HashMap::new(),
            target: Some(target),
        };
        let create = self
            .unary::<CreateImageRequest, CreateImageResponse>(
                "/containerd.services.images.v1.Images/Create",
                CreateImageRequest {
                    image: Some(image.clone()),
                },
            )
            .await;
        match create {
            Ok(_) => {
                self.logger.detail(&format!("Created image {}", name));
                Ok(())
            }
            Err(ImageError::Daemon(message)) if message.contains("AlreadyExists") || message.contains("already exists") => {
                let _: UpdateImageResponse = self
                    .unary(
                        "/containerd.services.images.v1.Images/Update",
                        UpdateImageRequest {
                            image: Some(image),
                            update_mask: None,
                        },
                    )
                    .await?;
                self.logger.detail(&format!("Updated image {}", name));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
