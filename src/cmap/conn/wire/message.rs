use bitflags::bitflags;
use bson::RawDocumentBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util::write_cstring,
};
#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::compression::Compressor;
use crate::{
    cmap::conn::command::Command,
    compression::Decoder,
    error::{Error, ErrorKind, Result},
};

/// Hard cap on inbound message size used before the handshake has reported the server's
/// `maxMessageSizeBytes`.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

const PAYLOAD_TYPE_DOCUMENT: u8 = 0;
const PAYLOAD_TYPE_SEQUENCE: u8 = 1;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: RawDocumentBuf,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

/// A kind 1 (document sequence) OP_MSG section.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Exhaust replies are requested when the command
    /// asks for them (awaitable hello).
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        let mut document_payload = command.body;
        document_payload.append("$db", command.target_db);

        Ok(Self {
            response_to: 0,
            flags,
            document_payload,
            document_sequences: command.document_sequences,
            checksum: None,
            request_id,
        })
    }

    /// Gets this message's command body.
    pub(crate) fn single_document_response(self) -> RawDocumentBuf {
        self.document_payload
    }

    /// Reads bytes from `reader` and deserializes them into a Message, decompressing an
    /// OP_COMPRESSED envelope if necessary.
    pub(crate) async fn read_from<T: AsyncRead + Unpin + Send>(
        reader: &mut T,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        if header.length < Header::LENGTH as i32 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "message length {} is shorter than the wire header",
                    header.length
                ),
            }
            .into());
        }
        if header.length > max_len {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "message length {} exceeds the maximum of {}",
                    header.length, max_len
                ),
            }
            .into());
        }

        let mut buf = vec![0u8; (header.length - Header::LENGTH as i32) as usize];
        reader.read_exact(&mut buf).await?;

        match header.op_code {
            OpCode::Message => Self::read_op_msg(buf.as_slice(), &header),
            OpCode::Compressed => Self::read_op_compressed(buf.as_slice(), &header),
        }
    }

    fn read_op_msg(mut reader: &[u8], header: &Header) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(read_u32(&mut reader)?);

        let mut document_payload = None;
        let mut document_sequences = Vec::new();

        // The optional CRC-32C trails the sections when CHECKSUM_PRESENT is set.
        let mut checksum = None;
        let mut sections_len = reader.len();
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            if sections_len < 4 {
                return Err(invalid_length(header));
            }
            sections_len -= 4;
            let mut crc = &reader[sections_len..];
            checksum = Some(read_u32(&mut crc)?);
        }
        let mut sections = &reader[..sections_len];

        while !sections.is_empty() {
            match read_u8(&mut sections)? {
                PAYLOAD_TYPE_DOCUMENT => {
                    let document = read_document(&mut sections)?;
                    if document_payload.replace(document).is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG reply contained multiple command body sections"
                                .to_string(),
                        }
                        .into());
                    }
                }
                PAYLOAD_TYPE_SEQUENCE => {
                    document_sequences.push(read_document_sequence(&mut sections, header)?);
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("invalid OP_MSG section payload type {}", other),
                    }
                    .into())
                }
            }
        }

        let document_payload = document_payload.ok_or_else(|| {
            Error::from(ErrorKind::InvalidResponse {
                message: "no command body section in OP_MSG reply".to_string(),
            })
        })?;

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload,
            document_sequences,
            checksum,
            request_id: None,
        })
    }

    fn read_op_compressed(mut reader: &[u8], header: &Header) -> Result<Self> {
        let original_opcode = read_i32(&mut reader)?;
        if original_opcode != OpCode::Message as i32 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The original opcode of the compressed message must be {}, but was {}.",
                    OpCode::Message as i32,
                    original_opcode,
                ),
            }
            .into());
        }

        let uncompressed_size = read_i32(&mut reader)?;
        if uncompressed_size < 4 {
            return Err(invalid_length(header));
        }
        let compressor_id = read_u8(&mut reader)?;

        let decoder = Decoder::from_u8(compressor_id)?;
        let buf = decoder.decode(reader)?;

        if buf.len() != uncompressed_size as usize {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated the uncompressed reply would be {} bytes long, but it \
                     instead was {}",
                    uncompressed_size,
                    buf.len(),
                ),
            }
            .into());
        }

        Self::read_op_msg(buf.as_slice(), header)
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<T: AsyncWrite + Unpin + Send>(&self, writer: &mut T) -> Result<()> {
        let sections = self.get_sections_bytes();

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or(0),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    /// Serializes the Message, wraps it in an OP_COMPRESSED envelope using the given compressor,
    /// and writes it to `writer`.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) async fn write_compressed_to<T: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut T,
        compressor: &Compressor,
    ) -> Result<()> {
        let flag_bytes = self.flags.bits().to_le_bytes();
        let section_bytes = self.get_sections_bytes();
        let uncompressed_len = section_bytes.len() + flag_bytes.len();

        let mut to_compress = Vec::with_capacity(uncompressed_len);
        to_compress.extend_from_slice(&flag_bytes);
        to_compress.extend_from_slice(&section_bytes);
        let compressed = compressor.compress(&to_compress)?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<u8>()
            + compressed.len();

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or(0),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer
            .write_all(&(uncompressed_len as i32).to_le_bytes())
            .await?;
        writer.write_all(&[compressor.id() as u8]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::new();

        sections.push(PAYLOAD_TYPE_DOCUMENT);
        sections.extend_from_slice(self.document_payload.as_bytes());

        for sequence in &self.document_sequences {
            sections.push(PAYLOAD_TYPE_SEQUENCE);

            // size bytes + identifier + null terminator + document bytes
            let identifier_bytes = sequence.identifier.as_bytes();
            let documents_len: usize = sequence.documents.iter().map(|d| d.as_bytes().len()).sum();
            let size = 4 + identifier_bytes.len() + 1 + documents_len;
            sections.extend_from_slice(&(size as i32).to_le_bytes());

            write_cstring(&mut sections, &sequence.identifier);

            for document in &sequence.documents {
                sections.extend_from_slice(document.as_bytes());
            }
        }

        sections
    }
}

fn invalid_length(header: &Header) -> Error {
    ErrorKind::InvalidResponse {
        message: format!(
            "the server indicated that the reply would be {} bytes long, but the sections it \
             contains do not add up to that",
            header.length
        ),
    }
    .into()
}

fn read_u8(reader: &mut &[u8]) -> Result<u8> {
    match reader.split_first() {
        Some((byte, rest)) => {
            *reader = rest;
            Ok(*byte)
        }
        None => Err(truncated_section()),
    }
}

fn read_i32(reader: &mut &[u8]) -> Result<i32> {
    if reader.len() < 4 {
        return Err(truncated_section());
    }
    let (bytes, rest) = reader.split_at(4);
    *reader = rest;
    Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    read_i32(reader).map(|i| i as u32)
}

/// Reads a single length-prefixed BSON document off the front of `reader`, validating the length
/// prefix against the remaining section bytes.
fn read_document(reader: &mut &[u8]) -> Result<RawDocumentBuf> {
    if reader.len() < 4 {
        return Err(truncated_section());
    }
    let declared = i32::from_le_bytes(reader[..4].try_into().unwrap());
    if declared < 5 || declared as usize > reader.len() {
        return Err(ErrorKind::InvalidResponse {
            message: format!("invalid BSON length prefix {} in OP_MSG section", declared),
        }
        .into());
    }

    let (document_bytes, rest) = reader.split_at(declared as usize);
    let document = RawDocumentBuf::from_bytes(document_bytes.to_vec())?;
    *reader = rest;
    Ok(document)
}

fn read_document_sequence(reader: &mut &[u8], header: &Header) -> Result<DocumentSequence> {
    let size = read_i32(reader)?;
    let mut remaining = (size as usize)
        .checked_sub(std::mem::size_of::<i32>())
        .ok_or_else(|| invalid_length(header))?;

    let terminator = reader
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(truncated_section)?;
    let identifier = std::str::from_utf8(&reader[..terminator])
        .map_err(|_| {
            Error::from(ErrorKind::InvalidResponse {
                message: "non-UTF-8 document sequence identifier".to_string(),
            })
        })?
        .to_string();
    *reader = &reader[terminator + 1..];
    remaining = remaining
        .checked_sub(terminator + 1)
        .ok_or_else(|| invalid_length(header))?;

    let mut documents = Vec::new();
    while remaining > 0 {
        let before = reader.len();
        documents.push(read_document(reader)?);
        let consumed = before - reader.len();
        remaining = remaining
            .checked_sub(consumed)
            .ok_or_else(|| invalid_length(header))?;
    }

    Ok(DocumentSequence {
        identifier,
        documents,
    })
}

fn truncated_section() -> Error {
    ErrorKind::InvalidResponse {
        message: "OP_MSG section ended before its declared length".to_string(),
    }
    .into()
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}
