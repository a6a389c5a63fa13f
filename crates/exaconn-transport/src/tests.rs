#[cfg(test)]
mod tests {
    use crate::compression::{Deflater, Inflater};
    use crate::endpoint::{TransferStats, TunnelEndpoint, TunnelMode, TunnelOptions};
    use crate::orphan::{current_parent_pid, is_orphaned};
    use crate::process::{parse_stats_line, stats_line, ProcessWorkerConfig};
    use exaconn_core::error::ErrorKind;
    use exaconn_protocol::http::{read_response_head, write_chunk, write_final_chunk};
    use exaconn_protocol::tunnel::{accept_proxy, ProxyAddress};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    async fn mock_proxy() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        (listener, addr)
    }

    async fn accept_tunnel(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.expect("accept");
        accept_proxy(&mut socket, &ProxyAddress::new("10.1.2.3", 20001))
            .await
            .expect("proxy handshake");
        socket
    }

    /// Database side of an EXPORT: PUT the chunks, then read the status.
    fn push_export(listener: TcpListener, chunks: Vec<Vec<u8>>) -> JoinHandle<u16> {
        tokio::spawn(async move {
            let mut socket = accept_tunnel(&listener).await;
            socket
                .write_all(
                    b"PUT /001.csv HTTP/1.1\r\nHost: 10.1.2.3:20001\r\nTransfer-Encoding: chunked\r\n\r\n",
                )
                .await
                .expect("request head");
            for chunk in &chunks {
                write_chunk(&mut socket, chunk).await.expect("chunk");
            }
            write_final_chunk(&mut socket).await.expect("final chunk");
            let mut reader = BufReader::new(socket);
            let (status, _) = read_response_head(&mut reader).await.expect("response");
            status
        })
    }

    /// Database side of an IMPORT: GET, then read the body until close.
    fn pull_import(listener: TcpListener, method: &'static str) -> JoinHandle<(u16, Vec<u8>)> {
        tokio::spawn(async move {
            let mut socket = accept_tunnel(&listener).await;
            let head = format!("{method} /001.csv HTTP/1.1\r\nHost: 10.1.2.3:20001\r\n\r\n");
            socket.write_all(head.as_bytes()).await.expect("request head");
            let mut reader = BufReader::new(socket);
            let status = match read_response_head(&mut reader).await {
                Ok((status, _)) => status,
                Err(_) => return (0, Vec::new()),
            };
            let mut body = Vec::new();
            let _ = reader.read_to_end(&mut body).await;
            (status, body)
        })
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut deflater = Deflater::new();
        let mut out = deflater.feed(data).expect("deflate");
        out.extend(deflater.finish().expect("finish"));
        out
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut inflater = Inflater::new();
        let mut out = inflater.feed(data).expect("inflate");
        out.extend(inflater.finish().expect("finish"));
        out
    }

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn export_round_trip() {
        let (listener, addr) = mock_proxy().await;
        let db = push_export(listener, vec![b"1,a\n".to_vec(), b"2,b\n".to_vec()]);

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr))
            .await
            .expect("connect");
        assert_eq!(endpoint.proxy().to_string(), "10.1.2.3:20001");
        let mut sink = Vec::new();
        let stats = endpoint.export_to(&mut sink).await.expect("export");

        assert_eq!(sink, b"1,a\n2,b\n");
        assert_eq!(stats.data_bytes, 8);
        assert_eq!(db.await.expect("db"), 200);
    }

    #[tokio::test]
    async fn compressed_export_is_inflated() {
        let payload = b"id,name\n1,alpha\n2,beta\n".repeat(50);
        let compressed = gzip(&payload);
        let (first, second) = compressed.split_at(compressed.len() / 2);
        let (listener, addr) = mock_proxy().await;
        let db = push_export(listener, vec![first.to_vec(), second.to_vec()]);

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr).with_compression(true))
            .await
            .expect("connect");
        let mut sink = Vec::new();
        let stats = endpoint.export_to(&mut sink).await.expect("export");

        assert_eq!(sink, payload);
        assert_eq!(stats.wire_bytes, compressed.len() as u64);
        assert_eq!(db.await.expect("db"), 200);
    }

    #[tokio::test]
    async fn import_round_trip() {
        let (listener, addr) = mock_proxy().await;
        let db = pull_import(listener, "GET");

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr))
            .await
            .expect("connect");
        let mut source: &[u8] = b"3,c\n4,d\n";
        let stats = endpoint.import_from(&mut source).await.expect("import");

        let (status, body) = db.await.expect("db");
        assert_eq!(status, 200);
        assert_eq!(body, b"3,c\n4,d\n");
        assert_eq!(stats.data_bytes, 8);
    }

    #[tokio::test]
    async fn compressed_import_is_gzip() {
        let payload = b"x;y\n".repeat(1000);
        let (listener, addr) = mock_proxy().await;
        let db = pull_import(listener, "GET");

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr).with_compression(true))
            .await
            .expect("connect");
        let mut source = payload.as_slice();
        endpoint.import_from(&mut source).await.expect("import");

        let (_, body) = db.await.expect("db");
        assert_eq!(gunzip(&body), payload);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let (listener, addr) = mock_proxy().await;
        let db = pull_import(listener, "POST");

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr))
            .await
            .expect("connect");
        let mut sink = Vec::new();
        let err = endpoint.export_to(&mut sink).await.expect_err("bad method");
        assert_eq!(err.kind(), ErrorKind::Transport);
        drop(db);
    }

    #[tokio::test]
    async fn sink_failure_is_a_callback_error() {
        let (listener, addr) = mock_proxy().await;
        let db = tokio::spawn(async move {
            let mut socket = accept_tunnel(&listener).await;
            let _ = socket
                .write_all(
                    b"PUT /001.csv HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nrow\n\r\n",
                )
                .await;
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr))
            .await
            .expect("connect");
        let err = endpoint
            .export_to(&mut BrokenSink)
            .await
            .expect_err("sink fails");
        assert!(matches!(err, exaconn_core::ExaError::Callback(ref m) if m.contains("disk full")));
        db.await.expect("db");
    }

    /// The database never checks the tunnel's throwaway certificate.
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    async fn accept_tls_tunnel(listener: &TcpListener) -> TlsStream<TcpStream> {
        let socket = accept_tunnel(listener).await;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        let name = ServerName::try_from("exaconn-tunnel").expect("server name");
        TlsConnector::from(Arc::new(config))
            .connect(name, socket)
            .await
            .expect("tls handshake")
    }

    #[tokio::test]
    async fn encrypted_export_round_trip() {
        let (listener, addr) = mock_proxy().await;
        let db = tokio::spawn(async move {
            let mut tls = accept_tls_tunnel(&listener).await;
            tls.write_all(b"PUT /000.csv HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .expect("request head");
            write_chunk(&mut tls, b"1,secret\n").await.expect("chunk");
            write_final_chunk(&mut tls).await.expect("final chunk");
            let mut reader = BufReader::new(tls);
            let (status, _) = read_response_head(&mut reader).await.expect("response");
            status
        });

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr).with_encryption(true))
            .await
            .expect("connect");
        let mut sink = Vec::new();
        let stats = endpoint.export_to(&mut sink).await.expect("export");

        assert_eq!(sink, b"1,secret\n");
        assert_eq!(stats.data_bytes, 9);
        assert_eq!(db.await.expect("db"), 200);
    }

    #[tokio::test]
    async fn encrypted_import_round_trip() {
        let (listener, addr) = mock_proxy().await;
        let db = tokio::spawn(async move {
            let mut tls = accept_tls_tunnel(&listener).await;
            tls.write_all(b"GET /000.csv HTTP/1.1\r\n\r\n")
                .await
                .expect("request head");
            let mut reader = BufReader::new(tls);
            let (status, _) = read_response_head(&mut reader).await.expect("response");
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await.expect("body");
            (status, body)
        });

        let endpoint = TunnelEndpoint::connect(TunnelOptions::new(addr).with_encryption(true))
            .await
            .expect("connect");
        let mut source: &[u8] = b"5,e\n6,f\n";
        endpoint.import_from(&mut source).await.expect("import");

        let (status, body) = db.await.expect("db");
        assert_eq!(status, 200);
        assert_eq!(body, b"5,e\n6,f\n");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let (listener, addr) = mock_proxy().await;
        drop(listener);
        let err = TunnelEndpoint::connect(TunnelOptions::new(addr))
            .await
            .expect_err("nothing listening");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn parent_is_alive_for_test_process() {
        let ppid = current_parent_pid().expect("unix parent pid");
        assert!(!is_orphaned(ppid));
        assert!(is_orphaned(ppid.wrapping_add(1)));
    }

    #[test]
    fn stats_line_is_read_back() {
        let stats = TransferStats {
            wire_bytes: 120,
            data_bytes: 4096,
        };
        let line = stats_line(&stats);
        assert_eq!(line, "120 4096\n");
        assert_eq!(parse_stats_line(&line).expect("stats"), stats);
        for bad in ["", "12", "12 x", "1 2 3"] {
            let err = parse_stats_line(bad).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::Transport);
        }
    }

    #[test]
    fn worker_config_defaults() {
        let addr: SocketAddr = "127.0.0.1:8563".parse().expect("addr");
        let config = ProcessWorkerConfig::new(addr, TunnelMode::Import, "/tmp/000.csv");
        assert_eq!(config.program.to_string_lossy(), "exaconn-tunnel");
        assert!(!config.compression);
        assert_eq!(config.mode.as_str(), "import");
    }
}
