use bson::doc;

use super::message::{DocumentSequence, Message, MessageFlags};
use crate::{bson_util, cmap::conn::command::Command};

#[tokio::test]
async fn op_msg_round_trip() {
    let command = Command::new("ping", "admin", doc! { "ping": 1, "$db": "admin" });
    let message = Message::from_command(&command, Some(42)).unwrap();

    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();

    let read = Message::read_from(bytes.as_slice(), None).await.unwrap();
    assert_eq!(read.body_document().unwrap(), command.body);
    assert!(read.document_sequences.is_empty());
    assert_eq!(read.flags, MessageFlags::empty());
}

#[tokio::test]
async fn document_sequences_are_encoded_as_kind_one_sections() {
    let mut command = Command::new("insert", "db", doc! { "insert": "coll", "$db": "db" });
    command.add_document_sequence(
        "documents",
        vec![
            bson_util::document_to_vec(&doc! { "_id": 1 }).unwrap(),
            bson_util::document_to_vec(&doc! { "_id": 2 }).unwrap(),
        ],
    );

    let message = Message::from_command(&command, None).unwrap();
    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();

    let read = Message::read_from(bytes.as_slice(), None).await.unwrap();
    assert_eq!(read.document_sequences.len(), 1);
    let DocumentSequence {
        ref identifier,
        ref documents,
    } = read.document_sequences[0];
    assert_eq!(identifier, "documents");
    assert_eq!(documents.len(), 2);
    assert_eq!(
        bson::from_slice::<bson::Document>(&documents[1]).unwrap(),
        doc! { "_id": 2 }
    );
}

#[tokio::test]
async fn exhaust_allowed_sets_flag_bit_sixteen() {
    let mut command = Command::new("hello", "admin", doc! { "hello": 1, "$db": "admin" });
    command.exhaust_allowed = true;

    let message = Message::from_command(&command, None).unwrap();
    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();

    // flagBits live directly after the 16-byte header.
    let flags = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    assert_eq!(flags, 1 << 16);
}

#[tokio::test]
async fn oversized_reply_is_rejected() {
    let command = Command::new("ping", "admin", doc! { "ping": 1 });
    let message = Message::from_command(&command, None).unwrap();
    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();

    assert!(Message::read_from(bytes.as_slice(), Some(16)).await.is_err());
}
