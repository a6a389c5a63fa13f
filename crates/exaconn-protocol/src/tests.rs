#[cfg(test)]
mod tests {
    use crate::codec::{Frame, WireCodec};
    use crate::http::{read_request_head, ChunkedReader, Method};
    use crate::messages::{Attributes, Request, Status};
    use crate::tunnel::{decode_handshake_reply, encode_handshake, open_proxy, ProxyAddress};
    use exaconn_core::error::ErrorKind;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    fn crafted_reply(port: i32, host: &[u8; 16]) -> [u8; 24] {
        let mut reply = [0u8; 24];
        reply[0..4].copy_from_slice(&7i32.to_le_bytes());
        reply[4..8].copy_from_slice(&port.to_le_bytes());
        reply[8..24].copy_from_slice(host);
        reply
    }

    #[test]
    fn handshake_packet_layout() {
        let packet = encode_handshake();
        assert_eq!(&packet[0..4], &0x0221_2102i32.to_le_bytes());
        assert_eq!(&packet[4..8], &1i32.to_le_bytes());
        assert_eq!(&packet[8..12], &1i32.to_le_bytes());
    }

    #[test]
    fn handshake_reply_trims_nul_padding() {
        let reply = crafted_reply(8364, b"127.18.0.2\0\0\0\0\0\0");
        let address = decode_handshake_reply(&reply).expect("decode");
        assert_eq!(address, ProxyAddress::new("127.18.0.2", 8364));
        assert_eq!(address.to_string(), "127.18.0.2:8364");
    }

    #[test]
    fn handshake_reply_rejects_bad_port() {
        let reply = crafted_reply(-1, b"10.0.0.1\0\0\0\0\0\0\0\0");
        assert!(decode_handshake_reply(&reply).is_err());
    }

    #[tokio::test]
    async fn open_proxy_against_mock_peer() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let peer = tokio::spawn(async move {
            let mut packet = [0u8; 12];
            server.read_exact(&mut packet).await.expect("read packet");
            assert_eq!(packet, encode_handshake());
            let reply = crafted_reply(8364, b"127.18.0.2\0\0\0\0\0\0");
            server.write_all(&reply).await.expect("write reply");
        });
        let address = open_proxy(&mut client).await.expect("handshake");
        peer.await.expect("peer");
        assert_eq!(address.host, "127.18.0.2");
        assert_eq!(address.port, 8364);
    }

    #[test]
    fn proxy_address_parses_display_form() {
        let address = ProxyAddress::parse("10.0.0.5:20001\n").expect("parse");
        assert_eq!(address, ProxyAddress::new("10.0.0.5", 20001));
        assert!(ProxyAddress::parse("nonsense").is_err());
    }

    #[tokio::test]
    async fn chunked_body_is_decoded() {
        let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n".to_vec();
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.expect("chunk") {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
        assert!(reader.next_chunk().await.expect("after end").is_none());
    }

    #[tokio::test]
    async fn chunk_size_line_is_bounded() {
        let body = vec![b'a'; 64 * 1024];
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        let err = reader.next_chunk().await.expect_err("endless size line");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("longer than"), "{err}");
    }

    #[tokio::test]
    async fn non_utf8_chunk_header_is_a_transport_error() {
        let body = b"\xff\xfe\r\nxx\r\n0\r\n\r\n".to_vec();
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        let err = reader.next_chunk().await.expect_err("binary header");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn chunked_body_requires_delimiter() {
        let body = b"5\r\nhelloXX0\r\n\r\n".to_vec();
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        let err = reader.next_chunk().await.expect_err("bad delimiter");
        assert!(err.to_string().contains("delimiter"));
    }

    #[tokio::test]
    async fn chunked_body_rejects_truncated_stream() {
        let body = b"5\r\nhello\r\n".to_vec();
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        assert!(reader.next_chunk().await.expect("first").is_some());
        assert!(reader.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn chunked_body_rejects_bad_length() {
        let body = b"zz\r\n".to_vec();
        let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
        assert!(reader.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn request_head_is_parsed() {
        let raw = b"PUT /000.csv HTTP/1.1\r\nHost: 10.0.0.1:8563\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.expect("head");
        assert_eq!(head.method, Method::Put);
        assert_eq!(head.path, "/000.csv");
        assert!(head.is_chunked());
        assert_eq!(head.header("host"), Some("10.0.0.1:8563"));
    }

    #[tokio::test]
    async fn request_head_rejects_unknown_method() {
        let raw = b"POST / HTTP/1.1\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn requests_serialize_to_wire_shape() {
        let payload = Request::Fetch {
            result_set_handle: 3,
            start_position: 1000,
            num_bytes: 5_000_000,
        }
        .into_payload()
        .expect("payload");
        assert_eq!(
            payload,
            json!({"command": "fetch", "resultSetHandle": 3, "startPosition": 1000, "numBytes": 5000000})
        );
        let payload = Request::GetAttributes.into_payload().expect("payload");
        assert_eq!(payload, json!({"command": "getAttributes"}));
        let payload = Request::Execute {
            sql_text: "SELECT 1".into(),
            attributes: None,
        }
        .into_payload()
        .expect("payload");
        assert_eq!(payload, json!({"command": "execute", "sqlText": "SELECT 1"}));
    }

    #[test]
    fn codec_compresses_after_switch() {
        let payload = json!({"command": "execute", "sqlText": "SELECT 1"});
        let plain = WireCodec::new(false).encode(&payload).expect("encode");
        assert!(matches!(plain, Frame::Text(_)));

        let codec = WireCodec::new(true);
        let frame = codec.encode(&json!({"status": "ok", "responseData": {"x": 1}})).expect("encode");
        assert!(matches!(frame, Frame::Binary(_)));
        let response = codec.decode(frame).expect("decode");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.response_data, Some(json!({"x": 1})));
    }

    #[test]
    fn codec_decodes_error_envelope() {
        let text = r#"{"status":"error","exception":{"text":"object not found","sqlCode":"42000"}}"#;
        let response = WireCodec::new(false)
            .decode(Frame::Text(text.into()))
            .expect("decode");
        assert_eq!(response.status, Status::Error);
        let exception = response.exception.expect("exception");
        assert_eq!(exception.sql_code, "42000");
    }

    #[test]
    fn attributes_merge_only_present_fields() {
        let mut current = Attributes {
            autocommit: Some(true),
            current_schema: Some("S1".into()),
            ..Default::default()
        };
        current.merge(&Attributes {
            current_schema: Some("S2".into()),
            ..Default::default()
        });
        assert_eq!(current.autocommit, Some(true));
        assert_eq!(current.current_schema.as_deref(), Some("S2"));
    }
}
