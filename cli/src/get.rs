use {
    crate::{resolve_password, term, Ctx},
    anyhow::{Context as _, Result},
    bytes::Bytes,
    kasta_sdk::{
        crypto::CipherVariant,
        header::ContainerFlags,
        pipe,
        pipeline::{decode, DecodeOutput},
        progress::{NoProgress, Progress},
    },
    std::{io, path::Path, sync::Arc},
    tokio::task,
    tracing::info,
    url::Url,
};

const PIPE_CAPACITY: usize = 16;

pub async fn get(ctx: &Ctx, dest: &Path, stdout: bool, checksum: bool, urls: &[Url]) -> Result<()> {
    // One download per argument; the first failure aborts the run.
    for url in urls {
        get_one(ctx, dest, stdout, checksum, url)
            .await
            .with_context(|| format!("failed to fetch {url}"))?;
    }
    Ok(())
}

async fn get_one(ctx: &Ctx, dest: &Path, stdout: bool, checksum: bool, url: &Url) -> Result<()> {
    let mut response = ctx.client.download(url).await?;
    let total = response.content_length().unwrap_or(0);
    let name = blob_name(url);

    // Peek the container header so a password can be prompted for before
    // the blocking decode starts.
    let mut head = Vec::new();
    while head.len() < ContainerFlags::LEN {
        match response.chunk().await? {
            Some(chunk) => head.extend_from_slice(&chunk),
            None => break,
        }
    }
    let flags = ContainerFlags::read_from(&head[..])?;
    let password = if flags.contains(ContainerFlags::ENCRYPTED) {
        Some(resolve_password(&ctx.config)?.into_bytes())
    } else {
        None
    };

    let progress: Arc<dyn Progress> = if stdout {
        Arc::new(NoProgress)
    } else {
        term::progress(format!("downloading {name}"))
    };
    let output = if stdout {
        DecodeOutput::Writer(Box::new(std::io::stdout()))
    } else {
        DecodeOutput::Disk {
            dir: dest.to_path_buf(),
            file_name: name.clone(),
        }
    };

    let (writer, reader) = pipe::bounded(PIPE_CAPACITY);
    let decode_task = task::spawn_blocking(move || {
        decode(reader, password.as_deref(), CipherVariant::Salted, output)
    });

    let mut received = head.len() as u64;
    progress.report(received, total);
    let mut pump_err = None;
    if let Err(err) = writer.send(Bytes::from(head)).await {
        pump_err = Some(err);
    } else {
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    received += chunk.len() as u64;
                    if let Err(err) = writer.send(chunk).await {
                        pump_err = Some(err);
                        break;
                    }
                    progress.report(received, total);
                }
                Ok(None) => break,
                Err(err) => {
                    pump_err = Some(io::Error::other(err));
                    break;
                }
            }
        }
    }
    match pump_err {
        // Forwarded into the pipe so the decoder aborts instead of
        // treating the truncation as end of input.
        Some(err) => writer.fail_async(err).await,
        None => drop(writer),
    }

    let report = decode_task.await.context("decoding task panicked")??;
    progress.finish();
    if checksum {
        // Stderr keeps the checksum apart from a payload going to stdout.
        if stdout {
            eprintln!("{}  {name}", report.digest);
        } else {
            println!("{}  {name}", report.digest);
        }
    }
    info!(
        "downloaded {name} ({})",
        term::pretty_size(report.container_size)
    );
    Ok(())
}

fn blob_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_owned()
}
