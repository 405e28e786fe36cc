/// Fill colors handed out to new annotations, in allocation order.
pub const ANNOTATION_PALETTE: [&str; 10] = [
    "#db5f57", // {r:219, g: 95, b: 87}
    "#dbae57", // {r:219, g:174, b: 87}
    "#b9db57", // {r:185, g:219, b: 87}
    "#69db57", // {r:105, g:219, b: 87}
    "#57db94", // {r: 87, g:219, b:148}
    "#57d3db", // {r: 87, g:211, b:219}
    "#5784db", // {r: 87, g:132, b:219}
    "#7957db", // {r:121, g: 87, b:219}
    "#c957db", // {r:201, g: 87, b:219}
    "#db579e", // {r:219, g: 87, b:158}
];

pub const PALETTE_LEN: usize = ANNOTATION_PALETTE.len();

pub type Palette = [String; PALETTE_LEN];

/// Round-robin color source. The n-th call since construction returns
/// `palette[n % 10]`.
#[derive(Debug, Clone)]
pub struct ColorAllocator {
    palette: Palette,
    issued: usize,
}

impl ColorAllocator {
    pub fn new(palette: Palette) -> Self {
        Self { palette, issued: 0 }
    }

    pub fn next_color(&mut self) -> String {
        let index = self.issued % PALETTE_LEN;
        self.issued = self.issued.wrapping_add(1);
        self.palette[index].clone()
    }

    pub fn issued(&self) -> usize {
        self.issued
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }
}

impl Default for ColorAllocator {
    fn default() -> Self {
        Self::new(default_palette())
    }
}

pub fn default_palette() -> Palette {
    ANNOTATION_PALETTE.map(String::from)
}
