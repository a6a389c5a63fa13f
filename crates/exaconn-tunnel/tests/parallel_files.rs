use exaconn_client::coordinator::{export_parallel_to_files, import_parallel_from_files};
use exaconn_client::mock_server::{MockDatabase, EXPORT_ROWS};
use exaconn_client::{ExportQuery, ImportQuery, ParallelOptions, Session};

fn process_options(workers: usize) -> ParallelOptions {
    ParallelOptions::new(workers).processes(env!("CARGO_BIN_EXE_exaconn-tunnel"))
}

#[tokio::test]
async fn process_workers_export_into_files() {
    let db = MockDatabase::start().await;
    let session = Session::connect(db.options()).await.expect("connect");
    let dir = tempfile::tempdir().expect("tempdir");
    let query = ExportQuery::table("T").file_format("txt");

    let (report, files) = export_parallel_to_files(&session, &query, &process_options(2), dir.path())
        .await
        .expect("export");

    assert_eq!(report.row_count, EXPORT_ROWS as u64);
    assert_eq!(files, vec![dir.path().join("000.txt"), dir.path().join("001.txt")]);
    let first = std::fs::read(&files[0]).expect("first file");
    let second = std::fs::read(&files[1]).expect("second file");
    assert_eq!(first, b"1,name1\n3,name3\n5,name5\n");
    assert_eq!(second, b"2,name2\n4,name4\n");
    assert_eq!(report.stats[0].data_bytes, first.len() as u64);
    assert_eq!(report.stats[1].data_bytes, second.len() as u64);
    assert!(db.commands().iter().any(|c| c == "getHosts"));
    session.close().await.expect("close");
}

#[tokio::test]
async fn process_workers_import_from_files() {
    let db = MockDatabase::start().await;
    let session = Session::connect(db.options()).await.expect("connect");
    let dir = tempfile::tempdir().expect("tempdir");
    let files = vec![dir.path().join("a.csv"), dir.path().join("b.csv")];
    std::fs::write(&files[0], b"1,x\n2,y\n").expect("write");
    std::fs::write(&files[1], b"3,z\n").expect("write");

    let report = import_parallel_from_files(&session, &ImportQuery::table("T"), &process_options(2), &files)
        .await
        .expect("import");

    assert_eq!(report.row_count, 3);
    assert_eq!(report.stats[0].data_bytes, 8);
    assert_eq!(report.stats[0].wire_bytes, 8);
    assert_eq!(report.stats[1].data_bytes, 4);
    let imported = String::from_utf8(db.imported()).expect("utf8");
    assert!(imported.contains("1,x\n2,y\n") && imported.contains("3,z\n"));
}

#[tokio::test]
async fn process_mode_needs_files() {
    let db = MockDatabase::start().await;
    let session = Session::connect(db.options()).await.expect("connect");
    let err = import_parallel_from_files(&session, &ImportQuery::table("T"), &process_options(2), &[])
        .await
        .expect_err("no files");
    assert_eq!(err.kind(), exaconn_client::ErrorKind::Runtime);
}
