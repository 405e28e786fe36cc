//! Tile URL template for WMS-backed raster layers.

use serde::Deserialize;

pub const TILE_SIZE: u32 = 512;
/// Replaced by the map engine with each tile's bounding box.
pub const BBOX_PLACEHOLDER: &str = "{bbox-epsg-3857}";

/// Caller-supplied options of `add_wms_layer`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WmsParams {
    #[serde(rename = "SLD_BODY", default)]
    pub sld_body: Option<String>,
}

pub fn tile_url(base_url: &str, params: &WmsParams) -> String {
    let tile_size = TILE_SIZE.to_string();
    let mut query: Vec<(&str, &str)> = vec![
        ("SERVICE", "WMS"),
        ("VERSION", "1.3.0"),
        ("REQUEST", "GetMap"),
        ("STYLES", ""),
        ("BBOX", BBOX_PLACEHOLDER),
        ("WIDTH", tile_size.as_str()),
        ("HEIGHT", tile_size.as_str()),
        ("FORMAT", "image/png"),
        ("TRANSPARENT", "true"),
        ("SRS", "EPSG:3857"),
        ("TILED", "true"),
    ];
    if let Some(sld_body) = params.sld_body.as_deref().filter(|body| !body.is_empty()) {
        query.push(("SLD_BODY", sld_body));
    }

    let mut url = String::from(base_url);
    for (key, value) in query {
        url.push('&');
        url.push_str(key);
        url.push('=');
        if value == BBOX_PLACEHOLDER {
            url.push_str(value);
        } else {
            encode_component(value, &mut url);
        }
    }
    url
}

fn encode_component(value: &str, out: &mut String) {
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
}
