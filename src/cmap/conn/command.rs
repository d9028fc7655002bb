use bson::{Document, RawDocumentBuf};
use serde::de::DeserializeOwned;

use super::wire::{DocumentSequence, Message};
use crate::{
    error::{Error, ErrorKind, Result},
    hello::HELLO_COMMAND_NAMES,
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Commands whose bodies must never appear in logs or travel compressed: everything that can
/// carry credentials.
const SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

/// Driver-side model of a database command.
///
/// The body is raw BSON; building it is the caller's concern. The core only appends the routing
/// fields it owns (`$db`, `$readPreference`, `txnNumber`).
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: RawDocumentBuf,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    pub(crate) fn new(
        name: impl ToString,
        target_db: impl ToString,
        body: RawDocumentBuf,
    ) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            document_sequences: Vec::new(),
            exhaust_allowed: false,
        }
    }

    pub(crate) fn new_from_document(
        name: impl ToString,
        target_db: impl ToString,
        body: Document,
    ) -> Result<Self> {
        Ok(Self::new(
            name,
            target_db,
            RawDocumentBuf::from_document(&body)?,
        ))
    }

    /// Attach a kind 1 document sequence section to this command.
    #[allow(dead_code)]
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<RawDocumentBuf>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) -> Result<()> {
        let doc = RawDocumentBuf::from_document(&read_preference.into_document())?;
        self.body.append("$readPreference", doc);
        Ok(())
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.append("txnNumber", txn_number);
    }

    /// Whether the command's body may appear in logs.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        SENSITIVE_COMMANDS.contains(&name.as_str()) || self.is_hello()
    }

    /// Whether this command is allowed to travel in an OP_COMPRESSED envelope. Sensitive
    /// commands and the hello handshake always go uncompressed.
    pub(crate) fn should_compress(&self) -> bool {
        !self.should_redact()
    }

    fn is_hello(&self) -> bool {
        let name = self.name.to_lowercase();
        HELLO_COMMAND_NAMES.contains(&name.as_str())
    }
}

/// A response to a command, backed by the raw reply bytes.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Self {
        Self {
            source,
            raw: message.single_document_response(),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    pub(crate) fn raw_body(&self) -> &bson::RawDocument {
        &self.raw
    }

    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// Deserialize the body of this response, returning an authentication error if it fails.
    pub(crate) fn auth_response_body<T: DeserializeOwned>(
        &self,
        mechanism_name: &str,
    ) -> Result<T> {
        self.body()
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
