use {
    crate::{resolve_password, term, Ctx},
    anyhow::{bail, Context as _, Result},
    fs_err as fs,
    kasta_sdk::{
        archive::{walk, WalkedEntry},
        client::UploadOptions,
        crypto::CipherVariant,
        pipe,
        pipeline::{encode, EncodeInput, EncodeReport, TransformOptions},
    },
    std::{
        io,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::task,
};

const PIPE_CAPACITY: usize = 16;

pub struct PutArgs {
    pub compress: bool,
    pub encrypt: bool,
    pub archive: bool,
    pub max_days: Option<u32>,
    pub max_downloads: Option<u32>,
    pub checksum: bool,
    pub files: Vec<PathBuf>,
}

enum Source {
    Stdin,
    File(PathBuf),
    Archive(Vec<WalkedEntry>),
}

pub async fn put(ctx: &Ctx, args: PutArgs) -> Result<()> {
    let transform = TransformOptions {
        compress: args.compress,
        encrypt: args.encrypt,
        cipher_variant: CipherVariant::Salted,
    };
    let password = if args.encrypt {
        Some(resolve_password(&ctx.config)?)
    } else {
        None
    };
    let upload_options = UploadOptions {
        max_days: args.max_days,
        max_downloads: args.max_downloads,
    };

    let has_stdin = args.files.iter().any(|path| path.as_os_str() == "-");
    if has_stdin && (args.files.len() > 1 || args.archive) {
        bail!("`-` (stdin) must be the only input and cannot be archived");
    }

    if args.archive {
        let mut entries = Vec::new();
        for file in &args.files {
            entries.extend(walk(file)?);
        }
        let name = archive_name(&args.files[0])?;
        let (report, url) = upload_one(
            ctx,
            &name,
            Source::Archive(entries),
            transform,
            password.as_deref(),
            upload_options,
        )
        .await?;
        print_result(&url, &name, args.checksum.then_some(&report));
    } else {
        // One upload per argument; the first failure aborts the run.
        for file in &args.files {
            let (name, source) = if file.as_os_str() == "-" {
                ("stdin".to_owned(), Source::Stdin)
            } else {
                (file_name(file)?, Source::File(file.clone()))
            };
            let (report, url) = upload_one(
                ctx,
                &name,
                source,
                transform,
                password.as_deref(),
                upload_options,
            )
            .await?;
            print_result(&url, &name, args.checksum.then_some(&report));
        }
    }
    Ok(())
}

/// Encodes `source` on a blocking task that feeds the upload body through a
/// bounded pipe, so the container is never buffered in full.
async fn upload_one(
    ctx: &Ctx,
    name: &str,
    source: Source,
    transform: TransformOptions,
    password: Option<&str>,
    options: UploadOptions,
) -> Result<(EncodeReport, String)> {
    let (writer, reader) = pipe::bounded(PIPE_CAPACITY);
    let fail_handle = writer.fail_handle();
    let progress = term::progress(format!("uploading {name}"));
    let task_progress = Arc::clone(&progress);
    let password = password.map(|password| password.as_bytes().to_vec());
    let encode_task = task::spawn_blocking(move || -> Result<EncodeReport> {
        let password = password.as_deref();
        let result = match source {
            Source::Stdin => {
                let mut stdin = std::io::stdin().lock();
                encode(
                    EncodeInput::Stream {
                        reader: &mut stdin,
                        size: None,
                    },
                    transform,
                    password,
                    &task_progress,
                    writer,
                )
            }
            Source::File(path) => {
                let mut file = fs::File::open(&path)?;
                let size = file.metadata()?.len();
                encode(
                    EncodeInput::Stream {
                        reader: &mut file,
                        size: Some(size),
                    },
                    transform,
                    password,
                    &task_progress,
                    writer,
                )
            }
            Source::Archive(entries) => encode(
                EncodeInput::Archive(&entries),
                transform,
                password,
                &task_progress,
                writer,
            ),
        };
        if let Err(err) = &result {
            // Error the request body so the server does not keep the
            // truncated container as a completed upload.
            fail_handle.fail(io::Error::other(err.to_string()));
        }
        result
    });
    let uploaded = ctx.client.upload(name, reader.into_stream(), None, options);
    let (encoded, uploaded) = tokio::join!(encode_task, uploaded);
    progress.finish();
    let encoded = encoded.context("encoding task panicked")?;
    match (encoded, uploaded) {
        (Ok(report), Ok(url)) => Ok((report, url)),
        (Err(err), Ok(_)) => Err(err),
        (Ok(_), Err(err)) => Err(err),
        (Err(encode_err), Err(upload_err)) => {
            // A dropped request body breaks the encoder's pipe, so a broken
            // pipe on the encode side points at the transport as the root
            // cause. Anything else means the encoder failed first and took
            // the upload down with it.
            let broken_pipe = encode_err
                .root_cause()
                .downcast_ref::<io::Error>()
                .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe);
            if broken_pipe {
                Err(upload_err)
            } else {
                Err(encode_err)
            }
        }
    }
}

fn print_result(url: &str, name: &str, report: Option<&EncodeReport>) {
    println!("{url}");
    if let Some(report) = report {
        println!("{}  {name}", report.digest);
    }
}

fn file_name(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("unsupported input path: {}", path.display()))?
        .to_owned())
}

fn archive_name(first_input: &Path) -> Result<String> {
    let stem = first_input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("unsupported input path: {}", first_input.display()))?;
    Ok(format!("{stem}.tar"))
}
