use crate::palette::{default_palette, ColorAllocator, Palette};

pub const DEFAULT_ANNOTATION_LAYER: &str = "annotation";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Layer name the draw surface reports its features under.
    pub annotation_layer: String,
    pub palette: Palette,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            annotation_layer: DEFAULT_ANNOTATION_LAYER.to_string(),
            palette: default_palette(),
        }
    }
}

/// Per-session allocation state. Ids start at 1 and are never reused,
/// even after the annotations they named are cleared.
#[derive(Debug)]
pub struct ClientSession {
    colors: ColorAllocator,
    last_id: u64,
}

impl ClientSession {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            colors: ColorAllocator::new(config.palette.clone()),
            last_id: 0,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn next_color(&mut self) -> String {
        self.colors.next_color()
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}
