#[cfg(test)]
mod tests {
    use dropsync::containment::ContainmentGuard;
    use dropsync::server;
    use dropsync::streaming::{EventBatch, RawEvent, RawEventKind, Session, SessionConfig};
    use dropsync::watcher::ChannelSource;
    use std::fs;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    struct Fixture {
        _temp: TempDir,
        client_root: PathBuf,
        server_root: PathBuf,
        addr: SocketAddr,
        stop: Option<oneshot::Sender<()>>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    async fn start() -> anyhow::Result<Fixture> {
        let temp = TempDir::new()?;
        let client_root = temp.path().join("watched");
        let server_root = temp.path().join("replica");
        fs::create_dir(&client_root)?;
        fs::create_dir(&server_root)?;
        let client_root = fs::canonicalize(client_root)?;
        let server_root = fs::canonicalize(server_root)?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let guard = Arc::new(ContainmentGuard::new(&server_root)?);
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server::serve(listener, guard, async {
            let _ = stopped.await;
        }));

        Ok(Fixture {
            _temp: temp,
            client_root,
            server_root,
            addr,
            stop: Some(stop),
        })
    }

    /// Poll until `check` holds; the server applies messages asynchronously.
    async fn wait_for(what: &str, check: impl Fn() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn read(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    fn batch(events: &[(RawEventKind, &str)]) -> EventBatch {
        EventBatch::new(
            events
                .iter()
                .map(|(kind, name)| RawEvent::new(*kind, *name))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_replicates_create_modify_rename_delete() -> anyhow::Result<()> {
        let fx = start().await?;
        let stream = TcpStream::connect(fx.addr).await?;
        let mut session = Session::new(
            SessionConfig {
                initial_scan: false,
                ..SessionConfig::new(fx.client_root.clone())
            },
            stream,
        );
        let replica = fx.server_root.clone();

        // Create
        fs::write(fx.client_root.join("a.txt"), "hello")?;
        session
            .accept_batch(batch(&[(RawEventKind::Added, "a.txt")]))
            .await?;
        assert_eq!(session.flush().await?, 1);
        wait_for("a.txt", || read(&replica.join("a.txt")).as_deref() == Some("hello")).await;

        // Modify
        fs::write(fx.client_root.join("a.txt"), "hello!")?;
        session
            .accept_batch(batch(&[(RawEventKind::Modified, "a.txt")]))
            .await?;
        assert_eq!(session.flush().await?, 1);
        wait_for("a.txt update", || {
            read(&replica.join("a.txt")).as_deref() == Some("hello!")
        })
        .await;

        // Touch with identical content sends nothing
        fs::write(fx.client_root.join("a.txt"), "hello!")?;
        session
            .accept_batch(batch(&[(RawEventKind::Modified, "a.txt")]))
            .await?;
        assert_eq!(session.flush().await?, 0);

        // Rename reported as two notifications
        fs::rename(fx.client_root.join("a.txt"), fx.client_root.join("b.txt"))?;
        session
            .accept_batch(batch(&[
                (RawEventKind::RenameFrom, "a.txt"),
                (RawEventKind::RenameTo, "b.txt"),
            ]))
            .await?;
        assert_eq!(session.flush().await?, 1);
        wait_for("rename", || {
            !replica.join("a.txt").exists()
                && read(&replica.join("b.txt")).as_deref() == Some("hello!")
        })
        .await;

        // Delete
        fs::remove_file(fx.client_root.join("b.txt"))?;
        session
            .accept_batch(batch(&[(RawEventKind::Removed, "b.txt")]))
            .await?;
        assert_eq!(session.flush().await?, 1);
        wait_for("delete", || !replica.join("b.txt").exists()).await;

        let stats = session.finish().await?;
        assert_eq!(stats.messages, 4);
        assert_eq!(stats.skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_loop_with_initial_scan() -> anyhow::Result<()> {
        let fx = start().await?;
        fs::create_dir(fx.client_root.join("docs"))?;
        fs::write(fx.client_root.join("docs/readme.md"), "# existing")?;
        fs::write(fx.client_root.join("big.bin"), vec![7u8; 200 * 1024])?;

        let stream = TcpStream::connect(fx.addr).await?;
        let session = Session::new(
            SessionConfig {
                frame_window: Duration::from_millis(50),
                ..SessionConfig::new(fx.client_root.clone())
            },
            stream,
        );
        let (tx, mut source) = ChannelSource::new();
        let run = tokio::spawn(async move {
            session
                .run(&mut source, std::future::pending::<()>())
                .await
        });

        let replica = fx.server_root.clone();
        wait_for("initial scan", || {
            read(&replica.join("docs/readme.md")).as_deref() == Some("# existing")
                && fs::metadata(replica.join("big.bin")).map(|m| m.len()).ok() == Some(200 * 1024)
        })
        .await;

        fs::write(fx.client_root.join("docs/new.md"), "fresh")?;
        tx.send(batch(&[(RawEventKind::Added, "docs/new.md")])).await?;
        wait_for("new file", || {
            read(&replica.join("docs/new.md")).as_deref() == Some("fresh")
        })
        .await;

        drop(tx);
        let stats = run.await??;
        assert_eq!(stats.messages, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_peer_does_not_affect_others() -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        let fx = start().await?;

        // A connection sending garbage is closed by the server
        let mut bad = TcpStream::connect(fx.addr).await?;
        bad.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n.....................")
            .await?;

        let stream = TcpStream::connect(fx.addr).await?;
        let mut session = Session::new(
            SessionConfig {
                initial_scan: false,
                ..SessionConfig::new(fx.client_root.clone())
            },
            stream,
        );
        fs::write(fx.client_root.join("ok.txt"), "fine")?;
        session
            .accept_batch(batch(&[(RawEventKind::Added, "ok.txt")]))
            .await?;
        session.flush().await?;

        let replica = fx.server_root.clone();
        wait_for("ok.txt", || read(&replica.join("ok.txt")).as_deref() == Some("fine")).await;
        session.finish().await?;
        Ok(())
    }
}
