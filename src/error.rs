#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("dial reverse proxy target: {0}")]
    Dial(#[source] std::io::Error),
    #[error("new ssh client conn: {0}")]
    TargetHandshake(#[source] russh::Error),
    #[error("target rejected credentials for user {0:?}")]
    TargetAuth(String),
    #[error("routing failed: {0}")]
    Route(color_eyre::Report),
    #[error("no target connection for this session")]
    NoTarget,
    #[error("invalid credential key: {0}")]
    InvalidKey(#[from] russh::keys::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}
