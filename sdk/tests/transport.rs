use {
    anyhow::Result,
    bytes::Bytes,
    futures::StreamExt,
    http_body_util::{BodyExt, Full},
    hyper::{body::Incoming, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode},
    hyper_util::rt::TokioIo,
    kasta_sdk::{
        client::{Client, UploadOptions},
        pipe,
    },
    std::{
        collections::HashMap,
        convert::Infallible,
        io::Write as _,
        sync::{Arc, Mutex},
    },
    tokio::net::TcpListener,
};

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Vec<u8>,
    max_days: Option<String>,
    max_downloads: Option<String>,
}

type Blobs = Arc<Mutex<HashMap<String, StoredBlob>>>;

/// Minimal in-process blob server speaking the upload protocol:
/// PUT stores the body and answers with the download URL, GET serves it back.
async fn start_server(blobs: Blobs) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let server_base = base_url.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let blobs = Arc::clone(&blobs);
            let base = server_base.clone();
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |request| handle(request, Arc::clone(&blobs), base.clone())),
                    )
                    .await;
            });
        }
    });
    Ok(base_url)
}

async fn handle(
    request: Request<Incoming>,
    blobs: Blobs,
    base_url: String,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let name = request.uri().path().trim_start_matches('/').to_owned();
    let response = if request.method() == Method::PUT {
        let max_days = header_string(&request, "Max-Days");
        let max_downloads = header_string(&request, "Max-Downloads");
        let content = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(_) => {
                return Ok(status_response(StatusCode::BAD_REQUEST));
            }
        };
        blobs.lock().unwrap().insert(
            name.clone(),
            StoredBlob {
                content,
                max_days,
                max_downloads,
            },
        );
        Response::new(Full::new(Bytes::from(format!("{base_url}/{name}\n"))))
    } else if request.method() == Method::GET {
        match blobs.lock().unwrap().get(&name) {
            Some(blob) => Response::new(Full::new(Bytes::from(blob.content.clone()))),
            None => status_response(StatusCode::NOT_FOUND),
        }
    } else {
        status_response(StatusCode::METHOD_NOT_ALLOWED)
    };
    Ok(response)
}

fn header_string(request: &Request<Incoming>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[tokio::test]
async fn upload_then_download() -> Result<()> {
    let blobs: Blobs = Arc::default();
    let base_url = start_server(Arc::clone(&blobs)).await?;
    let client = Client::new(Some(base_url.parse()?))?;

    let payload = b"container bytes go here".to_vec();
    let (writer, reader) = pipe::bounded(4);
    let body = payload.clone();
    let producer = tokio::spawn(async move {
        writer.send(Bytes::from(body)).await.unwrap();
    });
    let url = client
        .upload(
            "notes.txt",
            reader.into_stream(),
            Some(payload.len() as u64),
            UploadOptions::default(),
        )
        .await?;
    producer.await?;
    assert_eq!(url, format!("{base_url}/notes.txt"));

    let response = client.download(&url.parse()?).await?;
    let mut downloaded = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        downloaded.extend_from_slice(&chunk?);
    }
    assert_eq!(downloaded, payload);
    Ok(())
}

#[tokio::test]
async fn retention_headers_are_forwarded() -> Result<()> {
    let blobs: Blobs = Arc::default();
    let base_url = start_server(Arc::clone(&blobs)).await?;
    let client = Client::new(Some(base_url.parse()?))?;

    let (writer, reader) = pipe::bounded(1);
    writer.send(Bytes::from_static(b"x")).await?;
    drop(writer);
    client
        .upload(
            "limited.bin",
            reader.into_stream(),
            Some(1),
            UploadOptions {
                max_days: Some(7),
                max_downloads: Some(2),
            },
        )
        .await?;

    let stored = blobs.lock().unwrap().get("limited.bin").cloned().unwrap();
    assert_eq!(stored.max_days.as_deref(), Some("7"));
    assert_eq!(stored.max_downloads.as_deref(), Some("2"));
    assert_eq!(stored.content, b"x");
    Ok(())
}

#[tokio::test]
async fn failed_producer_aborts_the_upload() -> Result<()> {
    let blobs: Blobs = Arc::default();
    let base_url = start_server(Arc::clone(&blobs)).await?;
    let client = Client::new(Some(base_url.parse()?))?;

    let (writer, reader) = pipe::bounded(4);
    let fail_handle = writer.fail_handle();
    let producer = tokio::task::spawn_blocking(move || {
        let mut writer = writer;
        writer.write_all(&[0x42; 10_000]).unwrap();
        // The writer is gone once an encoder's finish chain has consumed
        // it; the detached handle reports the failure in its place.
        drop(writer);
        fail_handle.fail(std::io::Error::other("disk read failed"));
    });

    let result = client
        .upload(
            "blob.bin",
            reader.into_stream(),
            None,
            UploadOptions::default(),
        )
        .await;
    producer.await?;
    // The request body errored out, so no blob may survive under a live URL.
    assert!(result.is_err());
    assert!(!blobs.lock().unwrap().contains_key("blob.bin"));
    Ok(())
}

#[tokio::test]
async fn download_of_missing_blob_fails() -> Result<()> {
    let blobs: Blobs = Arc::default();
    let base_url = start_server(blobs).await?;
    let client = Client::new(Some(base_url.parse()?))?;

    let err = client
        .download(&format!("{base_url}/no-such-blob").parse()?)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    Ok(())
}
