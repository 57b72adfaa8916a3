use crate::{
    config::Config,
    connection::Connection,
    error::{H2Error, LocalError},
    handshake::{self, UpgradeResult},
    request::Request,
    response::Response,
};
use anyhow::anyhow;
use log::{debug, trace};
use std::{collections::HashMap, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName},
    TlsConnector,
};

/// Where one authority stands, protocol-wise.
enum PoolEntry {
    /// An h2c upgrade is unresolved; a second request now would have to be
    /// pipelined into an ambiguous connection, so it is refused instead.
    Upgrading,
    Http2(Arc<Connection>),
    /// The peer declined HTTP/2; stick to HTTP/1.1 for this authority.
    NeverHttp2,
}

pub struct Client {
    config: Config,
    rustls_config: Arc<rustls::ClientConfig>,
    pool: tokio::sync::Mutex<HashMap<String, PoolEntry>>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Self::with_tls(config, Arc::new(tls))
    }

    pub fn with_tls(config: Config, rustls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            rustls_config,
            pool: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: url::Url) -> anyhow::Result<Response> {
        self.request(Request::get(url, None)).await
    }

    pub async fn request(&self, request: Request) -> anyhow::Result<Response> {
        let authority = request
            .pseudo(":authority")
            .ok_or_else(|| anyhow!("request has no authority"))?
            .to_owned();
        trace!("{} {}", request.pseudo(":method").unwrap_or("?"), request.url);

        if let Some(pooled) = self.pooled(&authority).await? {
            return Ok(pooled.request(request).await?);
        }

        match request.url.scheme() {
            "https" => self.connect_tls(&request, &authority).await,
            "http" if self.config.prior_knowledge => {
                let tcp = self.connect_tcp(&request).await?;
                let connection =
                    Arc::new(handshake::prior_knowledge(tcp, self.config.clone()).await?);
                self.pool
                    .lock()
                    .await
                    .insert(authority, PoolEntry::Http2(connection.clone()));
                Ok(connection.request(request).await?)
            }
            "http" => self.connect_upgrade(&request, &authority).await,
            other => Err(anyhow!("unsupported scheme {other:?}")),
        }
    }

    /// A live pooled session for this authority, or an error when the
    /// authority is mid-upgrade. `Ok(None)` means the caller establishes.
    async fn pooled(&self, authority: &str) -> anyhow::Result<Option<Arc<Connection>>> {
        let mut pool = self.pool.lock().await;
        match pool.get(authority) {
            Some(PoolEntry::Upgrading) => {
                Err(H2Error::from(LocalError::UpgradeInProgress).into())
            }
            Some(PoolEntry::Http2(connection)) => {
                if connection.last_error().await.is_none() {
                    Ok(Some(connection.clone()))
                } else {
                    debug!("dropping dead session for {authority}");
                    pool.remove(authority);
                    Ok(None)
                }
            }
            Some(PoolEntry::NeverHttp2) | None => Ok(None),
        }
    }

    async fn connect_tcp(&self, request: &Request) -> anyhow::Result<TcpStream> {
        let addr = *request
            .url
            .socket_addrs(|| None)?
            .first()
            .ok_or_else(|| anyhow!("no address for {}", request.url))?;
        Ok(TcpStream::connect(addr).await?)
    }

    /// ALPN path: offer h2 with an http/1.1 fallback and commit to whatever
    /// the TLS handshake negotiated.
    async fn connect_tls(&self, request: &Request, authority: &str) -> anyhow::Result<Response> {
        let host = request
            .url
            .host_str()
            .ok_or_else(|| anyhow!("no host in {}", request.url))?
            .to_owned();
        let tcp = self.connect_tcp(request).await?;
        let server_name =
            ServerName::try_from(host.as_str()).map_err(|_| anyhow!("invalid host {host:?}"))?;
        let connector = TlsConnector::from(self.rustls_config.clone());
        let mut tls = connector.connect(server_name, tcp).await?;

        if tls.get_ref().1.alpn_protocol() == Some(b"h2".as_ref()) {
            let connection = Arc::new(Connection::handshake(tls, self.config.clone()).await?);
            self.pool
                .lock()
                .await
                .insert(authority.to_owned(), PoolEntry::Http2(connection.clone()));
            Ok(connection.request(request.clone()).await?)
        } else {
            debug!("ALPN fell back to HTTP/1.1 for {authority}");
            self.pool
                .lock()
                .await
                .insert(authority.to_owned(), PoolEntry::NeverHttp2);
            Ok(handshake::http1_exchange(&mut tls, request, None).await?)
        }
    }

    /// Cleartext path: run the h2c upgrade dance, or plain HTTP/1.1 when the
    /// dance is disabled or was declined before.
    async fn connect_upgrade(&self, request: &Request, authority: &str) -> anyhow::Result<Response> {
        let mut tcp = self.connect_tcp(request).await?;
        let never = self.config.never_force_upgrade
            || matches!(
                self.pool.lock().await.get(authority),
                Some(PoolEntry::NeverHttp2)
            );
        if never {
            return Ok(handshake::http1_exchange(&mut tcp, request, None).await?);
        }

        self.pool
            .lock()
            .await
            .insert(authority.to_owned(), PoolEntry::Upgrading);
        match handshake::upgrade(tcp, self.config.clone(), request.clone()).await {
            Ok(UpgradeResult::Http2 {
                connection,
                response,
            }) => {
                self.pool
                    .lock()
                    .await
                    .insert(authority.to_owned(), PoolEntry::Http2(Arc::new(connection)));
                Ok(response.response().await?)
            }
            Ok(UpgradeResult::Http1 { response }) => {
                self.pool
                    .lock()
                    .await
                    .insert(authority.to_owned(), PoolEntry::NeverHttp2);
                Ok(response)
            }
            Err(err) => {
                self.pool.lock().await.remove(authority);
                Err(err.into())
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
