use crate::peer::types::ServerConfig;
use rand::Rng;

/// Случайный hex-идентификатор (сессии или соединения)
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Схемы, с которыми URL ICE сервера уже готов к использованию
const ICE_SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];

/// URL ICE сервера со схемой; без неё схема выводится из типа сервера
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    let url = config.url.trim();
    if ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return url.to_string();
    }
    match config.r#type.as_str() {
        "turn" => format!("turn:{}", url),
        _ => format!("stun:{}", url),
    }
}
