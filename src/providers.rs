//! Raster tile sources: remote XYZ endpoints and local MBTiles files.

use crate::{
    config::ProviderConfig,
    coords::TileIndex,
    error::{ConfigurationError, ProviderError},
};
use futures::future::BoxFuture;
use rusqlite::{Connection, Error, OpenFlags, OptionalExtension};
use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::spawn_blocking;

pub trait TileProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Raw encoded image bytes of `tile`.
    fn fetch(&self, tile: TileIndex) -> BoxFuture<'_, Result<Vec<u8>, ProviderError>>;
}

/// XYZ endpoint such as `https://tiles.example.com/{z}/{x}/{y}.jpeg`.
pub struct HttpTileProvider {
    name: String,
    url_template: String,
    client: reqwest::Client,
}

impl HttpTileProvider {
    pub fn new(
        name: impl Into<String>,
        url_template: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();

        let url_template = url_template.into();

        if ["{z}", "{x}", "{y}"]
            .iter()
            .any(|placeholder| !url_template.contains(placeholder))
        {
            return Err(ConfigurationError::InvalidProvider {
                name,
                reason: format!("URL template {url_template} needs {{z}}, {{x}} and {{y}}"),
            });
        }

        Ok(Self {
            name,
            url_template,
            client,
        })
    }

    pub fn url(&self, tile: TileIndex) -> String {
        self.url_template
            .replace("{z}", &tile.zoom.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

impl TileProvider for HttpTileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, tile: TileIndex) -> BoxFuture<'_, Result<Vec<u8>, ProviderError>> {
        Box::pin(async move {
            let response = self.client.get(self.url(tile)).send().await?;

            let status = response.status();

            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ProviderError::Missing {
                    provider: self.name.clone(),
                    tile,
                });
            }

            if !status.is_success() {
                return Err(ProviderError::Status {
                    provider: self.name.clone(),
                    status: status.as_u16(),
                    tile,
                });
            }

            Ok(response.bytes().await?.to_vec())
        })
    }
}

// thread-local SQLite connections, one per MBTiles file
thread_local! {
    static THREAD_DB: RefCell<HashMap<PathBuf, Connection>> = RefCell::new(HashMap::new());
}

const SELECT_TILE_SQL: &str =
    "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3";

/// Read-only MBTiles file. Rows are stored in TMS order.
pub struct MbtilesTileProvider {
    name: String,
    path: PathBuf,
}

impl MbtilesTileProvider {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ConfigurationError> {
        let name = name.into();

        let path = path.into();

        if !path.exists() {
            return Err(ConfigurationError::InvalidProvider {
                name,
                reason: format!("{} does not exist", path.display()),
            });
        }

        Ok(Self { name, path })
    }
}

fn read_tile(path: &Path, tile: TileIndex) -> Result<Option<Vec<u8>>, Error> {
    THREAD_DB.with(|db_cell| {
        let mut connections = db_cell.borrow_mut();

        if !connections.contains_key(path) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;

            connections.insert(path.to_path_buf(), conn);
        }

        let Some(conn) = connections.get(path) else {
            return Ok(None);
        };

        let mut stmt = conn.prepare_cached(SELECT_TILE_SQL)?;

        stmt.query_row((tile.zoom, tile.x, tile.reversed_y()), |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()
    })
}

impl TileProvider for MbtilesTileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, tile: TileIndex) -> BoxFuture<'_, Result<Vec<u8>, ProviderError>> {
        Box::pin(async move {
            let path = self.path.clone();

            match spawn_blocking(move || read_tile(&path, tile)).await?? {
                Some(data) => Ok(data),
                None => Err(ProviderError::Missing {
                    provider: self.name.clone(),
                    tile,
                }),
            }
        })
    }
}

/// Providers in configured priority order.
pub fn build_providers(
    configs: &[ProviderConfig],
    client: &reqwest::Client,
) -> Result<Vec<Arc<dyn TileProvider>>, ConfigurationError> {
    if configs.is_empty() {
        return Err(ConfigurationError::NoProviders);
    }

    configs
        .iter()
        .map(|config| match config {
            ProviderConfig::Http { name, url } => HttpTileProvider::new(name, url, client.clone())
                .map(|provider| Arc::new(provider) as Arc<dyn TileProvider>),
            ProviderConfig::Mbtiles { name, path } => MbtilesTileProvider::new(name, path)
                .map(|provider| Arc::new(provider) as Arc<dyn TileProvider>),
        })
        .collect()
}
