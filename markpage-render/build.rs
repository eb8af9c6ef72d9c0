use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use tar::Archive;
use ureq::{AgentBuilder, Error as UreqError};
use walkdir::WalkDir;
use zip::read::ZipArchive;

const PDFIUM_VERSION: &str = "7350";
const RELEASE_BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

const WATCHED_ENV: &[&str] = &[
    "MARKPAGE_PDFIUM_SKIP_DOWNLOAD",
    "MARKPAGE_PDFIUM_ARCHIVE_PATH",
    "MARKPAGE_PDFIUM_VERSION",
    "MARKPAGE_PDFIUM_PLATFORM",
    "MARKPAGE_PDFIUM_BASE_URL",
    "PDFIUM_DYNAMIC_LIB_PATH",
    "PDFIUM_STATIC_LIB_PATH",
];

/// Where to find or fetch a Pdfium shared library for the target.
struct FetchPlan {
    staging: PathBuf,
    target_os: String,
    platform: String,
    version: String,
    base_url: String,
    archive: Option<PathBuf>,
}

impl FetchPlan {
    fn from_env() -> Result<Self> {
        let out_dir = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR is not set")?);
        let target_os = env::var("CARGO_CFG_TARGET_OS").context("CARGO_CFG_TARGET_OS is not set")?;
        let target_arch =
            env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH is not set")?;
        Ok(Self {
            staging: out_dir.join("pdfium"),
            platform: env::var("MARKPAGE_PDFIUM_PLATFORM")
                .unwrap_or_else(|_| platform_for(&target_os, &target_arch)),
            version: env::var("MARKPAGE_PDFIUM_VERSION")
                .unwrap_or_else(|_| PDFIUM_VERSION.to_string()),
            base_url: env::var("MARKPAGE_PDFIUM_BASE_URL")
                .unwrap_or_else(|_| RELEASE_BASE_URL.to_string()),
            archive: env::var_os("MARKPAGE_PDFIUM_ARCHIVE_PATH").map(PathBuf::from),
            target_os,
        })
    }

    /// Returns the path of a usable library, fetching and unpacking it when
    /// the staging directory does not hold one yet.
    fn resolve(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.staging)
            .with_context(|| format!("failed to create {:?}", self.staging))?;
        if let Some(found) = self.find_library() {
            return Ok(found);
        }

        let archive = match &self.archive {
            Some(path) => path.clone(),
            None => self.download()?,
        };
        unpack(&archive, &self.staging)?;
        self.find_library()
            .ok_or_else(|| anyhow!("no Pdfium library inside {:?}", archive))
    }

    fn find_library(&self) -> Option<PathBuf> {
        let wanted = match self.target_os.as_str() {
            "windows" => "pdfium.dll",
            "macos" => "libpdfium.dylib",
            _ => "libpdfium.so",
        };
        WalkDir::new(&self.staging)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_file() && entry.file_name() == wanted)
            .map(|entry| entry.into_path())
    }

    fn download(&self) -> Result<PathBuf> {
        let cache = self.staging.join("downloads");
        fs::create_dir_all(&cache).with_context(|| format!("failed to create {:?}", cache))?;

        let names = [
            format!("pdfium-{}.tgz", self.platform),
            format!("pdfium-{}-{}.tgz", self.version, self.platform),
        ];
        let mut failures = Vec::new();
        for name in names {
            let destination = cache.join(&name);
            if destination.exists() {
                return Ok(destination);
            }
            let url = format!(
                "{}/chromium/{}/{}",
                self.base_url.trim_end_matches('/'),
                self.version,
                name
            );
            match fetch(&url, &destination) {
                Ok(()) => return Ok(destination),
                Err(err) => failures.push(err.to_string()),
            }
        }
        bail!(
            "could not download Pdfium {} for {}: {}",
            self.version,
            self.platform,
            failures.join("; ")
        )
    }
}

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    for name in WATCHED_ENV {
        println!("cargo:rerun-if-env-changed={name}");
    }

    if env::var_os("CARGO_FEATURE_PDF").is_none()
        || env::var_os("MARKPAGE_PDFIUM_SKIP_DOWNLOAD").is_some()
        || env::var_os("PDFIUM_DYNAMIC_LIB_PATH").is_some()
        || env::var_os("PDFIUM_STATIC_LIB_PATH").is_some()
    {
        return Ok(());
    }

    // Offline builds still succeed; the runtime falls back to a system Pdfium.
    match FetchPlan::from_env()?.resolve() {
        Ok(library) => {
            let library = library
                .to_str()
                .ok_or_else(|| anyhow!("library path {:?} is not UTF-8", library))?;
            println!("cargo:rustc-env=MARKPAGE_PDFIUM_LIBRARY_PATH={library}");
        }
        Err(err) => println!("cargo:warning=Pdfium was not bundled: {err:#}"),
    }
    Ok(())
}

fn platform_for(target_os: &str, target_arch: &str) -> String {
    let os = match target_os {
        "macos" => "mac",
        other => other,
    };
    let arch = match target_arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

fn fetch(url: &str, destination: &Path) -> Result<()> {
    let agent = AgentBuilder::new()
        .timeout_read(Duration::from_secs(120))
        .timeout_write(Duration::from_secs(120))
        .build();
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(UreqError::Status(code, _)) => bail!("GET {url} returned HTTP {code}"),
        Err(err) => bail!("GET {url} failed: {err}"),
    };

    let partial = destination.with_extension("part");
    let mut file =
        File::create(&partial).with_context(|| format!("failed to create {:?}", partial))?;
    io::copy(&mut response.into_reader(), &mut file)
        .with_context(|| format!("failed to write {:?}", partial))?;
    file.flush()?;
    fs::rename(&partial, destination)?;
    Ok(())
}

fn unpack(archive: &Path, destination: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("failed to open {:?}", archive))?;
    let extension = archive
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "tgz" | "gz" => Archive::new(GzDecoder::new(file))
            .unpack(destination)
            .with_context(|| format!("failed to unpack {:?}", archive))?,
        "zip" => ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(destination))
            .with_context(|| format!("failed to extract {:?}", archive))?,
        other => bail!("unsupported archive type {other:?} for {:?}", archive),
    }
    Ok(())
}
