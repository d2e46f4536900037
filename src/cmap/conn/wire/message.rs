use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode};
use crate::{
    bson_util,
    cmap::conn::command::Command,
    compression::{self, Compressor},
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    // OP_MSG payload type 0: the raw BSON bytes of the command body.
    pub(crate) document_payload: Vec<u8>,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

#[derive(Clone, Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Vec<u8>>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. Note that the `response_to` field must be set
    /// manually.
    pub(crate) fn from_command(command: &Command, request_id: Option<i32>) -> Result<Self> {
        let document_payload = bson_util::document_to_vec(&command.body)?;

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Ok(Self {
            document_payload,
            document_sequences: command.document_sequences.clone(),
            response_to: 0,
            flags,
            checksum: None,
            request_id,
        })
    }

    /// Decodes the body of this message into a `Document`.
    pub(crate) fn body_document(&self) -> Result<Document> {
        Ok(bson::from_slice(self.document_payload.as_slice())?)
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<T: AsyncRead + Unpin + Send>(
        mut reader: T,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(&mut reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len || (header.length as usize) < Header::LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "message length {} out of bounds (maximum {})",
                    header.length, max_len
                ),
            }
            .into());
        }

        let length_remaining = header.length as usize - Header::LENGTH;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        match header.op_code {
            OpCode::Message => Self::read_op_common(buf, &header),
            OpCode::Compressed => Self::read_op_compressed(buf, &header),
        }
    }

    fn read_op_compressed(buf: Vec<u8>, header: &Header) -> Result<Self> {
        let mut reader = buf.as_slice();

        // The original opcode of a compressed server reply is always OP_MSG.
        let original_opcode = ReadBytesExt::read_i32::<LittleEndian>(&mut reader)?;
        if original_opcode != OpCode::Message as i32 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the original opcode of the compressed message must be {}, but was {}",
                    OpCode::Message as i32,
                    original_opcode,
                ),
            }
            .into());
        }

        let uncompressed_size = ReadBytesExt::read_i32::<LittleEndian>(&mut reader)?;
        let compressor_id = ReadBytesExt::read_u8(&mut reader)?;

        let decompressed = compression::decompress(compressor_id, reader)?;

        if decompressed.len() != uncompressed_size as usize {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the server's message claims that the uncompressed length is {}, but it was \
                     computed to be {}",
                    uncompressed_size,
                    decompressed.len(),
                ),
            }
            .into());
        }

        Self::read_op_common(decompressed, header)
    }

    fn read_op_common(buf: Vec<u8>, header: &Header) -> Result<Self> {
        let mut length_remaining = buf.len();
        let mut reader = buf.as_slice();

        let flags = MessageFlags::from_bits_truncate(ReadBytesExt::read_u32::<LittleEndian>(&mut reader)?);
        length_remaining -= std::mem::size_of::<u32>();

        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while length_remaining > 4 {
            let (section, bytes_read) = MessageSection::read(&mut reader)?;
            length_remaining -= bytes_read;

            match section {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG response must contain exactly one payload type 0 \
                                      section"
                                .into(),
                        }
                        .into());
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        let mut checksum = None;
        if length_remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(ReadBytesExt::read_u32::<LittleEndian>(&mut reader)?);
        } else if length_remaining != 0 {
            return Err(Error::invalid_response(format!(
                "the server indicated that the reply would be {} bytes long, but {} trailing \
                 bytes could not be interpreted",
                header.length, length_remaining,
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<T: AsyncWrite + Send + Unpin>(&self, mut writer: T) -> Result<()> {
        let sections = self.get_sections_bytes();

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::invalid_argument("command exceeds maximum message size"))?,
            request_id: self.request_id.unwrap_or_else(super::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(&mut writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_u32_le(checksum).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    /// Serializes the message to bytes, compresses those bytes, and writes the bytes.
    pub(crate) async fn write_compressed_to<T: AsyncWrite + Unpin + Send>(
        &self,
        mut writer: T,
        compressor: &Compressor,
    ) -> Result<()> {
        let flag_bytes = self.flags.bits().to_le_bytes();
        let sections = self.get_sections_bytes();

        let mut uncompressed = Vec::with_capacity(flag_bytes.len() + sections.len());
        uncompressed.extend_from_slice(&flag_bytes);
        uncompressed.extend_from_slice(&sections);

        let compressed = compressor.compress(&uncompressed)?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<i32>()
            + std::mem::size_of::<u8>()
            + compressed.len();

        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::invalid_argument("command exceeds maximum message size"))?,
            request_id: self.request_id.unwrap_or_else(super::next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(&mut writer).await?;
        writer.write_i32_le(OpCode::Message as i32).await?;
        writer
            .write_i32_le(uncompressed.len() as i32)
            .await?;
        writer.write_u8(compressor.id()).await?;
        writer.write_all(&compressed).await?;

        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend_from_slice(&self.document_payload);

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let identifier_bytes = document_sequence.identifier.as_bytes();
            let documents_size: usize = document_sequence
                .documents
                .iter()
                .map(|document| document.len())
                .sum();

            // Size bytes + identifier bytes + null-terminator byte + document bytes
            let size = 4 + identifier_bytes.len() + 1 + documents_size;
            sections.extend_from_slice(&(size as i32).to_le_bytes());

            sections.extend_from_slice(identifier_bytes);
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend_from_slice(document);
            }
        }

        sections
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug)]
enum MessageSection {
    Document(Vec<u8>),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection, returning the
    /// section along with the number of bytes consumed (including the payload type byte).
    fn read(reader: &mut &[u8]) -> Result<(Self, usize)> {
        let payload_type = ReadBytesExt::read_u8(reader)?;

        if payload_type == 0 {
            let bytes = bson_util::read_document_bytes(&mut *reader)?;
            let read = 1 + bytes.len();
            return Ok((MessageSection::Document(bytes), read));
        }

        let size = ReadBytesExt::read_i32::<LittleEndian>(reader)?;
        if size < 5 {
            return Err(Error::invalid_response(format!(
                "invalid OP_MSG document sequence length: {}",
                size
            )));
        }
        let mut length_remaining = size as usize - std::mem::size_of::<i32>();

        let mut identifier_bytes = Vec::new();
        loop {
            let byte = ReadBytesExt::read_u8(reader)?;
            length_remaining -= 1;
            if byte == 0 {
                break;
            }
            identifier_bytes.push(byte);
        }
        let identifier = String::from_utf8(identifier_bytes)
            .map_err(|_| Error::invalid_response("invalid document sequence identifier"))?;

        let mut documents = Vec::new();
        while length_remaining > 0 {
            let bytes = bson_util::read_document_bytes(&mut *reader)?;
            if bytes.len() > length_remaining {
                return Err(Error::invalid_response(
                    "document sequence length does not match its contents",
                ));
            }
            length_remaining -= bytes.len();
            documents.push(bytes);
        }

        Ok((
            MessageSection::Sequence(DocumentSequence {
                identifier,
                documents,
            }),
            1 + size as usize,
        ))
    }
}
