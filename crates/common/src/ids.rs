use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use uuid::Uuid;

pub const UUID_LEN: usize = 27;

pub const COLLECTION: &str = "4zz18";
pub const CONTAINER: &str = "dz642";
pub const CONTAINER_REQUEST: &str = "xvhdp";
pub const GROUP: &str = "j7d0g";
pub const USER: &str = "tpzed";
pub const LINK: &str = "o0j2j";
pub const SPECIMEN: &str = "j58dm";
pub const API_CLIENT_AUTHORIZATION: &str = "gj3su";
pub const KEEP_SERVICE: &str = "bi6l4";

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Owning cluster of an object UUID, or `""` for anything that is not a
/// 27-character UUID (PDHs, bogus ids).
pub fn cluster_of(uuid: &str) -> &str {
    if uuid.len() == UUID_LEN && uuid.is_char_boundary(5) {
        &uuid[..5]
    } else {
        ""
    }
}

pub fn object_type(uuid: &str) -> &str {
    if uuid.len() == UUID_LEN && uuid.is_char_boundary(11) {
        &uuid[6..11]
    } else {
        ""
    }
}

pub fn is_uuid(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-z]{5}-[0-9a-z]{5}-[0-9a-z]{15}$").expect("static regex")
    })
    .is_match(s)
}

pub fn is_pdh(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{32}\+\d+(\+\S+)*$").expect("static regex"))
        .is_match(s)
}

pub fn is_cluster_id(s: &str) -> bool {
    s.len() == 5 && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

pub fn new_uuid(cluster_id: &str, type_code: &str) -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut suffix = [0u8; 15];
    for slot in suffix.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    format!(
        "{cluster_id}-{type_code}-{}",
        String::from_utf8_lossy(&suffix)
    )
}

pub fn new_request_id() -> String {
    let mut rng = rand::thread_rng();
    let tail: String = (0..20)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("req-{tail}")
}
