//! StyledLayerDescriptor documents for raster WMS layers.
//!
//! The map client passes the rendered XML through untouched as the
//! `SLD_BODY` parameter of its tile requests.

use std::borrow::Cow;

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SldError {
    #[error("a multiband style needs exactly 3 bands, got {0}")]
    BandCount(usize),
    #[error("bands must be specified as integer indexes starting from 1")]
    BandIndex,
    #[error("number of bands ({bands}) must be equal to number of ranges ({ranges})")]
    RangeCount { bands: usize, ranges: usize },
    #[error("number of gamma values ({gammas}) must be equal to number of bands ({bands})")]
    GammaCount { bands: usize, gammas: usize },
}

/// A scalar applied to every band, or one value per band.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PerBand<T> {
    All(T),
    Each(Vec<T>),
}

impl<T: Clone> PerBand<T> {
    fn expand(&self, bands: usize) -> Vec<T> {
        match self {
            PerBand::All(value) => vec![value.clone(); bands],
            PerBand::Each(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultibandOptions {
    pub title: Option<String>,
    pub bands: Vec<i64>,
    pub range: PerBand<[f64; 2]>,
    pub gamma: PerBand<f64>,
    pub opacity: f64,
    #[serde(rename = "channelNames")]
    pub channel_names: Vec<String>,
}

impl Default for MultibandOptions {
    fn default() -> Self {
        Self {
            title: None,
            bands: vec![1, 2, 3],
            range: PerBand::All([0.0, 1.0]),
            gamma: PerBand::All(1.0),
            opacity: 1.0,
            channel_names: ["RedChannel", "GreenChannel", "BlueChannel"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SingleBandOptions {
    pub title: Option<String>,
    pub opacity: f64,
    #[serde(rename = "channelName")]
    pub channel_name: String,
    pub colormap: Option<Vec<Map<String, Value>>>,
    pub colormap_type: String,
}

impl Default for SingleBandOptions {
    fn default() -> Self {
        Self {
            title: None,
            opacity: 1.0,
            channel_name: "GrayChannel".to_string(),
            colormap: None,
            colormap_type: "ramp".to_string(),
        }
    }
}

struct Normalize {
    min: f64,
    max: f64,
    gamma: f64,
}

struct Channel<'a> {
    name: &'a str,
    band: i64,
    normalize: Option<Normalize>,
}

struct ColorMap<'a> {
    kind: &'a str,
    entries: &'a [Map<String, Value>],
}

pub fn multiband_raster_sld(name: &str, options: &MultibandOptions) -> Result<String, SldError> {
    let bands = &options.bands;
    if bands.len() != 3 {
        return Err(SldError::BandCount(bands.len()));
    }
    if bands.iter().any(|band| *band < 1) {
        return Err(SldError::BandIndex);
    }
    let ranges = options.range.expand(bands.len());
    if ranges.len() != bands.len() {
        return Err(SldError::RangeCount {
            bands: bands.len(),
            ranges: ranges.len(),
        });
    }
    let gammas = options.gamma.expand(bands.len());
    if gammas.len() != bands.len() {
        return Err(SldError::GammaCount {
            bands: bands.len(),
            gammas: gammas.len(),
        });
    }

    let title = options.title.clone().unwrap_or_else(|| {
        let list: Vec<String> = bands.iter().map(i64::to_string).collect();
        format!("Style for bands {} of layer {name}", list.join(","))
    });
    let channels: Vec<Channel> = options
        .channel_names
        .iter()
        .zip(bands)
        .zip(ranges.iter().zip(&gammas))
        .map(|((channel, band), ([min, max], gamma))| Channel {
            name: channel,
            band: *band,
            normalize: Some(Normalize {
                min: *min,
                max: *max,
                gamma: *gamma,
            }),
        })
        .collect();
    Ok(render(name, &title, options.opacity, &channels, None))
}

pub fn single_band_raster_sld(name: &str, band: i64, options: &SingleBandOptions) -> String {
    let title = options
        .title
        .clone()
        .unwrap_or_else(|| format!("Style for band {band} of layer {name}"));
    let channel = Channel {
        name: &options.channel_name,
        band,
        normalize: None,
    };
    let colormap = options.colormap.as_deref().map(|entries| ColorMap {
        kind: &options.colormap_type,
        entries,
    });
    render(name, &title, options.opacity, &[channel], colormap)
}

fn render(
    name: &str,
    title: &str,
    opacity: f64,
    channels: &[Channel],
    colormap: Option<ColorMap>,
) -> String {
    let mut xml = String::from(concat!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n",
        "<StyledLayerDescriptor version=\"1.0.0\"",
        " xsi:schemaLocation=\"http://www.opengis.net/sld StyledLayerDescriptor.xsd\"",
        " xmlns=\"http://www.opengis.net/sld\"",
        " xmlns:ogc=\"http://www.opengis.net/ogc\"",
        " xmlns:xlink=\"http://www.w3.org/1999/xlink\"",
        " xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">\n",
    ));
    xml.push_str("<NamedLayer>\n");
    xml.push_str(&format!("<Name>{}</Name>\n", v_htmlescape::escape(name)));
    xml.push_str("<UserStyle>\n");
    xml.push_str(&format!("<Title>{}</Title>\n", v_htmlescape::escape(title)));
    xml.push_str("<IsDefault>1</IsDefault>\n<FeatureTypeStyle>\n<Rule>\n<RasterSymbolizer>\n");
    xml.push_str(&format!("<Opacity>{opacity}</Opacity>\n"));
    xml.push_str("<ChannelSelection>\n");
    for channel in channels {
        let tag = v_htmlescape::escape(channel.name);
        xml.push_str(&format!("<{tag}>\n"));
        xml.push_str(&format!(
            "<SourceChannelName>{}</SourceChannelName>\n",
            channel.band
        ));
        if let Some(normalize) = &channel.normalize {
            xml.push_str("<ContrastEnhancement>\n<Normalize>\n");
            xml.push_str(
                "<VendorOption name=\"algorithm\">StretchToMinimumMaximum</VendorOption>\n",
            );
            xml.push_str(&format!(
                "<VendorOption name=\"minValue\">{}</VendorOption>\n",
                normalize.min
            ));
            xml.push_str(&format!(
                "<VendorOption name=\"maxValue\">{}</VendorOption>\n",
                normalize.max
            ));
            xml.push_str("</Normalize>\n");
            xml.push_str(&format!("<GammaValue>{}</GammaValue>\n", normalize.gamma));
            xml.push_str("</ContrastEnhancement>\n");
        }
        xml.push_str(&format!("</{tag}>\n"));
    }
    xml.push_str("</ChannelSelection>\n");
    if let Some(colormap) = colormap {
        xml.push_str(&format!("<ColorMap type=\"{}\">\n", v_htmlescape::escape(colormap.kind)));
        for entry in colormap.entries {
            xml.push_str("<ColorMapEntry");
            for (key, value) in entry {
                let value = match value {
                    Value::String(text) => Cow::Borrowed(text.as_str()),
                    other => Cow::Owned(other.to_string()),
                };
                xml.push_str(&format!(" {}=\"{}\"", v_htmlescape::escape(key), v_htmlescape::escape(&value)));
            }
            xml.push_str("/>\n");
        }
        xml.push_str("</ColorMap>\n");
    }
    xml.push_str("</RasterSymbolizer>\n</Rule>\n</FeatureTypeStyle>\n</UserStyle>\n</NamedLayer>\n");
    xml.push_str("</StyledLayerDescriptor>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn multiband_defaults() {
        let xml = multiband_raster_sld("rgb", &MultibandOptions::default()).unwrap();
        assert!(xml.contains("<Title>Style for bands 1,2,3 of layer rgb</Title>"));
        assert!(xml.contains("<Opacity>1</Opacity>"));
        for channel in ["RedChannel", "GreenChannel", "BlueChannel"] {
            assert!(xml.contains(&format!("<{channel}>")));
        }
        assert_eq!(xml.matches("<ContrastEnhancement>").count(), 3);
        assert_eq!(
            xml.matches("<VendorOption name=\"maxValue\">1</VendorOption>").count(),
            3
        );
        assert!(!xml.contains("<ColorMap"));
    }

    #[test]
    fn multiband_per_band_values() {
        let options: MultibandOptions = serde_json::from_value(json!({
            "bands": [4, 3, 2],
            "range": [[1, 2], [2, 3], [3, 4]],
            "gamma": [0.1, 0.2, 0.3],
            "opacity": 0.5
        }))
        .unwrap();
        let xml = multiband_raster_sld("rgb", &options).unwrap();
        assert!(xml.contains("<Title>Style for bands 4,3,2 of layer rgb</Title>"));
        assert!(xml.contains("<Opacity>0.5</Opacity>"));
        assert!(xml.contains(
            "<RedChannel>\n<SourceChannelName>4</SourceChannelName>"
        ));
        assert!(xml.contains("<VendorOption name=\"minValue\">3</VendorOption>"));
        assert!(xml.contains("<GammaValue>0.2</GammaValue>"));
    }

    #[test]
    fn multiband_rejects_bad_shapes() {
        let two_bands = MultibandOptions {
            bands: vec![1, 2],
            ..MultibandOptions::default()
        };
        assert_eq!(multiband_raster_sld("x", &two_bands), Err(SldError::BandCount(2)));

        let zero_band = MultibandOptions {
            bands: vec![0, 1, 2],
            ..MultibandOptions::default()
        };
        assert_eq!(multiband_raster_sld("x", &zero_band), Err(SldError::BandIndex));

        let short_ranges = MultibandOptions {
            range: PerBand::Each(vec![[0.0, 1.0]]),
            ..MultibandOptions::default()
        };
        assert_eq!(
            multiband_raster_sld("x", &short_ranges),
            Err(SldError::RangeCount { bands: 3, ranges: 1 })
        );

        let long_gamma = MultibandOptions {
            gamma: PerBand::Each(vec![1.0; 4]),
            ..MultibandOptions::default()
        };
        assert_eq!(
            multiband_raster_sld("x", &long_gamma),
            Err(SldError::GammaCount { bands: 3, gammas: 4 })
        );
    }

    #[test]
    fn single_band_with_colormap() {
        let options: SingleBandOptions = serde_json::from_value(json!({
            "colormap": [
                {"color": "#000000", "quantity": "95", "opacity": 0.1},
                {"color": "#0000FF", "quantity": "110"}
            ]
        }))
        .unwrap();
        let xml = single_band_raster_sld("ndvi", 9, &options);
        assert!(xml.contains("<Title>Style for band 9 of layer ndvi</Title>"));
        assert!(xml.contains("<GrayChannel>\n<SourceChannelName>9</SourceChannelName>\n</GrayChannel>"));
        assert!(!xml.contains("<ContrastEnhancement>"));
        assert!(xml.contains("<ColorMap type=\"ramp\">"));
        let first = xml.lines().find(|line| line.contains("#000000")).unwrap();
        assert!(first.starts_with("<ColorMapEntry "));
        assert!(first.contains(" quantity=\"95\""));
        assert!(first.contains(" opacity=\"0.1\""));
        assert_eq!(xml.matches("<ColorMapEntry").count(), 2);
    }

    #[test]
    fn text_is_escaped() {
        let xml = single_band_raster_sld("a<b>&c", 1, &SingleBandOptions::default());
        assert!(xml.contains("<Name>a&lt;b&gt;&amp;c</Name>"));
        assert!(!xml.contains("<ColorMap"));
    }

    #[test]
    fn attribute_values_cannot_break_out_of_quotes() {
        let options: SingleBandOptions = serde_json::from_value(json!({
            "colormap": [{"label": "x\" onload=\"y", "quantity": 1}]
        }))
        .unwrap();
        let xml = single_band_raster_sld("dem", 1, &options);
        assert!(!xml.contains("\" onload="));
        assert!(xml.contains("&quot;"));
        assert!(xml.contains(" quantity=\"1\""));
    }
}
