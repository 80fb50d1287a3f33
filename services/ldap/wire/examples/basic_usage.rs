//! Basic usage example for the LDAP wire codec.

use bytes::BytesMut;
use ldap_wire::{
    Filter, FrameDecoder, Message, Request, RequestMessage, SearchRequest, SearchScope,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== LDAP Wire Codec Example ===\n");

    // 1. Encode a search request with message ID 1
    let search = SearchRequest::new(
        "dc=example,dc=com",
        SearchScope::Subtree,
        Filter::eq("uid", "jdoe"),
    )
    .with_attributes(["cn", "mail"]);
    let frame = Message::new(1, Request::Search(search)).encode();
    println!("1. Encoded search request: {} bytes", frame.len());

    // 2. Feed it to the frame decoder one byte at a time
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    let mut decoded = None;
    for byte in frame.iter() {
        buf.extend_from_slice(&[*byte]);
        if let Some(f) = decoder.decode(&mut buf)? {
            decoded = Some(f);
        }
    }
    let decoded = decoded.ok_or("frame never completed")?;
    println!("2. Reassembled frame: {} bytes", decoded.len());

    // 3. Parse it back
    let message = RequestMessage::parse(decoded)?;
    println!(
        "3. Parsed message id={} op={}",
        message.message_id,
        message.op.name()
    );

    Ok(())
}
