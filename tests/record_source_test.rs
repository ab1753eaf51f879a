use secure_file_ingest::config::{Compression, RunConfig};
use secure_file_ingest::error::FailureKind;
use secure_file_ingest::services::fpe::LocalFpeProvider;
use secure_file_ingest::services::record_source::{
    Decryption, RecordReader, RecordSourceConfig, SchemaField, Value, read_all,
};
use secure_file_ingest::services::source_fs::{SchemeSourceFs, SourceFs};
use secure_file_ingest::services::storage::LocalUploader;
use secure_file_ingest::services::worker::Worker;
use sequoia_openpgp as openpgp;
use openpgp::cert::prelude::*;
use openpgp::serialize::SerializeInto;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const ORDERS: &str = "Order_Id,Amount,Placed,Paid,Note\n\
                      1,12.50,2024-03-07 10:15:00,true,\n\
                      2,7.25,2024-03-08 08:00:00.5,false,rush\n";

/// Writes a fresh key pair: public half for uploads, secret half for reads.
fn write_keys(dir: &Path) -> (PathBuf, PathBuf) {
    let (cert, _rev) = CertBuilder::new()
        .add_userid("records-test <records@example.com>")
        .add_transport_encryption_subkey()
        .generate()
        .unwrap();
    let public = dir.join("public.asc");
    let secret = dir.join("secret.asc");
    std::fs::write(&public, cert.armored().to_vec().unwrap()).unwrap();
    std::fs::write(&secret, cert.as_tsk().armored().to_vec().unwrap()).unwrap();
    (public, secret)
}

/// Uploads `orders.csv` as a binary file with the given options and returns
/// the path of the stored object.
async fn upload(input: &TempDir, output: &TempDir, extra: &[(&str, &str)], key: &str) -> PathBuf {
    let source = input.path().join("in");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("orders.csv"), ORDERS).unwrap();

    let mut options = BTreeMap::new();
    options.insert(
        "path".to_string(),
        format!("file://{}", output.path().display()),
    );
    for (k, v) in extra {
        options.insert(k.to_string(), v.to_string());
    }
    let config = RunConfig::from_options(&options).unwrap();

    let source_fs = SchemeSourceFs::local();
    let descriptors = source_fs
        .list(&source.to_string_lossy(), "file:///", false)
        .await
        .unwrap();
    let worker = Worker::new(
        &config,
        &LocalFpeProvider,
        Arc::new(source_fs),
        Arc::new(LocalUploader::new(output.path(), 512)),
    )
    .unwrap();
    let summary = worker.run(descriptors, 1).await;
    worker.shutdown().unwrap();
    assert_eq!(summary.succeeded, 1, "{:?}", summary.outcomes);

    output.path().join("in").join(key)
}

fn schema() -> Vec<SchemaField> {
    SchemaField::parse_list(
        "order_id:long,amount:decimal,placed:timestamp_micros,paid:boolean,note:string",
    )
    .unwrap()
}

fn check_orders(records: &[secure_file_ingest::services::record_source::Record]) {
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, 1);
    assert_eq!(records[0].values[0], Value::Long(1));
    assert_eq!(records[0].values[3], Value::Boolean(true));
    assert_eq!(records[0].values[4], Value::Null);
    assert_eq!(
        records[1].values[2],
        Value::TimestampMicros(1_709_884_800_500_000)
    );
    assert_eq!(records[1].values[4], Value::String("rush".to_string()));
}

#[tokio::test]
async fn test_reads_back_pgp_upload() {
    let (input, output, keys) = (
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
    );
    let (public, secret) = write_keys(keys.path());
    let public = public.to_string_lossy().into_owned();

    let object = upload(
        &input,
        &output,
        &[("encryption", "pgp"), ("publicKeyPath", public.as_str())],
        "orders.csv.pgp",
    )
    .await;

    let config = RecordSourceConfig {
        decryption: Decryption::Pgp {
            secret_key_path: secret,
            password: None,
        },
        decompression: Compression::None,
        schema: schema(),
    };
    let records = read_all(object, config).await.unwrap();
    check_orders(&records);
}

#[tokio::test]
async fn test_reads_back_pgp_compressed_upload() {
    let (input, output, keys) = (
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
    );
    let (public, secret) = write_keys(keys.path());
    let public = public.to_string_lossy().into_owned();

    let object = upload(
        &input,
        &output,
        &[
            ("encryption", "pgp"),
            ("compression", "zip"),
            ("publicKeyPath", public.as_str()),
        ],
        "orders.csv.zip.pgp",
    )
    .await;

    let config = RecordSourceConfig {
        decryption: Decryption::Pgp {
            secret_key_path: secret,
            password: None,
        },
        decompression: Compression::Zip,
        schema: schema(),
    };
    let records = read_all(object, config).await.unwrap();
    check_orders(&records);
}

#[tokio::test]
async fn test_reads_back_zip_and_gzip_uploads() {
    for (compression, key) in [
        (Compression::Zip, "orders.csv.zip"),
        (Compression::Gzip, "orders.csv.gz"),
    ] {
        let (input, output) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let option = if compression == Compression::Zip { "zip" } else { "gzip" };
        let object = upload(&input, &output, &[("compression", option)], key).await;

        let config = RecordSourceConfig {
            decryption: Decryption::None,
            decompression: compression,
            schema: schema(),
        };
        let mut reader = RecordReader::open(&object, &config).unwrap();
        let records: Vec<_> = reader.by_ref().map(Result::unwrap).collect();
        check_orders(&records);
        assert_eq!(reader.progress(), Some(1.0));
    }
}

#[tokio::test]
async fn test_wrong_secret_key_is_crypto_error() {
    let (input, output, keys) = (
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
        TempDir::new().unwrap(),
    );
    let (public, _) = write_keys(keys.path());
    let public = public.to_string_lossy().into_owned();
    let object = upload(
        &input,
        &output,
        &[("encryption", "pgp"), ("publicKeyPath", public.as_str())],
        "orders.csv.pgp",
    )
    .await;

    let other = TempDir::new().unwrap();
    let (_, wrong_secret) = write_keys(other.path());
    let config = RecordSourceConfig {
        decryption: Decryption::Pgp {
            secret_key_path: wrong_secret,
            password: None,
        },
        decompression: Compression::None,
        schema: schema(),
    };
    let err = read_all(object, config).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::CryptoError);
}
