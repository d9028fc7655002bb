use std::sync::LazyLock;

use bson::{doc, Document, RawDocumentBuf};

use crate::{
    client::auth::{ClientFirst, Credential},
    cmap::{Command, Connection, StreamDescription},
    error::Result,
    hello::{hello_command, HelloReply},
    options::{Compressor, DriverInfo},
};

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
    platform: String,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    architecture: String,
}

impl ClientMetadata {
    fn to_document(&self) -> Document {
        let mut metadata_doc = Document::new();

        if let Some(ref application) = self.application {
            metadata_doc.insert("application", doc! { "name": application.name.clone() });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": self.driver.name.clone(),
                "version": self.driver.version.clone(),
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": self.os.os_type.clone(),
                "architecture": self.os.architecture.clone(),
            },
        );

        metadata_doc.insert("platform", self.platform.clone());

        metadata_doc
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the `hello` or legacy hello command.
static BASE_CLIENT_METADATA: LazyLock<ClientMetadata> = LazyLock::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: "mongodb-core".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
    platform: format!("rust edition 2021, {}", std::env::consts::FAMILY),
});

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello or legacy hello command to send when handshaking. This will always be identical
    /// given the same pool options, so it can be created at the time the Handshaker is created.
    metadata: ClientMetadata,

    compressors: Option<Vec<Compressor>>,
}

#[derive(Debug)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) compressors: Option<Vec<Compressor>>,
    pub(crate) driver_info: Option<DriverInfo>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Result<Self> {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        if let Some(app_name) = options.app_name {
            metadata.application = Some(AppMetadata { name: app_name });
        }

        if let Some(driver_info) = options.driver_info {
            metadata.driver.name.push('|');
            metadata.driver.name.push_str(&driver_info.name);

            if let Some(ref version) = driver_info.version {
                metadata.driver.version.push('|');
                metadata.driver.version.push_str(version);
            }

            if let Some(ref platform) = driver_info.platform {
                metadata.platform.push('|');
                metadata.platform.push_str(platform);
            }
        }

        Ok(Self {
            metadata,
            compressors: options.compressors,
        })
    }

    /// Constructs the initial hello command this handshaker will send, along with the
    /// speculative-auth client first message included in it, if any.
    async fn build_command(
        &self,
        credential: Option<&Credential>,
    ) -> Result<(Command, Option<ClientFirst>)> {
        let mut command = hello_command(None, None);

        command
            .body
            .append("client", RawDocumentBuf::from_document(&self.metadata.to_document())?);

        if let Some(ref compressors) = self.compressors {
            let mut compressor_names = bson::RawArrayBuf::new();
            for compressor in compressors {
                compressor_names.push(compressor.name());
            }
            command.body.append("compression", compressor_names);
        }

        let client_first = match credential {
            Some(credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);

                let client_first = credential.build_speculative_client_first().await?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .append("speculativeAuthenticate", client_first.to_document()?);
                }
                client_first
            }
            None => None,
        };

        Ok((command, client_first))
    }

    /// Handshakes a connection: runs the initial hello, records the resulting
    /// `StreamDescription`, negotiates compression, and authenticates.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let (command, client_first) = self.build_command(credential).await?;
        let response = conn.send_command(command).await?;
        let hello_reply = response.into_hello_reply()?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.server_id = hello_reply.command_response.connection_id;

        // Record the first compressor in the user's list that the server also supports.
        self.negotiate_compression(conn, &hello_reply);

        if let Some(credential) = credential {
            let server_first = hello_reply
                .command_response
                .speculative_authenticate
                .clone();
            let first_round = client_first.and_then(|cf| server_first.map(|sf| cf.into_first_round(sf)));
            credential.authenticate_stream(conn, first_round).await?;
        }

        Ok(hello_reply)
    }

    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    fn negotiate_compression(&self, conn: &mut Connection, hello_reply: &HelloReply) {
        if let (Some(configured), Some(server_side)) = (
            self.compressors.as_ref(),
            hello_reply.command_response.compressors.as_ref(),
        ) {
            conn.compressor = configured
                .iter()
                .find(|c| server_side.iter().any(|name| name == c.name()))
                .cloned();
        }
    }

    #[cfg(not(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    )))]
    fn negotiate_compression(&self, _conn: &mut Connection, _hello_reply: &HelloReply) {}
}
