//! Colour allocation for time ranges.

/// Base palette handed out before generated colours
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#bfef45",
    "#469990", "#9a6324", "#800000", "#000075",
];

/// Colours remembered as taken before the oldest is recycled
const MAX_TRACKED: usize = 50;

/// First palette colour not in `used`, then generated hues
pub fn unique_color(used: &[String]) -> String {
    let taken = |color: &str| used.iter().any(|u| u.eq_ignore_ascii_case(color));
    if let Some(color) = PALETTE.iter().find(|c| !taken(c)) {
        return (*color).to_string();
    }
    (0..360u32)
        .map(|i| hsl_to_hex((i * 137) % 360, 0.65, 0.45))
        .find(|color| !taken(color))
        .unwrap_or_else(|| PALETTE[used.len() % PALETTE.len()].to_string())
}

/// Shades of `base` for members of one group: index 0 is `base`, later ones get lighter
pub fn color_holder(base: &str) -> impl Fn(usize) -> String + use<> {
    let rgb = parse_hex(base);
    let base = base.to_string();
    move |index| match rgb {
        Some((r, g, b)) if index > 0 => {
            let factor = (index as f64 * 0.12).min(0.85);
            let mix = |c: u8| (c as f64 + (255.0 - c as f64) * factor).round() as u8;
            format!("#{:02x}{:02x}{:02x}", mix(r), mix(g), mix(b))
        }
        _ => base.clone(),
    }
}

/// Hands out distinct colours and takes them back when ranges go away
#[derive(Clone, Debug, Default)]
pub struct ColorAllocator {
    used: Vec<String>,
}

impl ColorAllocator {
    pub fn next_color(&mut self) -> String {
        let color = unique_color(&self.used);
        if self.used.len() > MAX_TRACKED {
            self.used.remove(0);
        }
        self.used.push(color.clone());
        color
    }

    /// Mark a colour chosen elsewhere as taken
    pub fn reserve(&mut self, color: &str) {
        if !self.used.iter().any(|c| c == color) {
            self.used.push(color.to_string());
        }
    }

    pub fn release(&mut self, color: &str) {
        self.used.retain(|c| c != color);
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}

fn parse_hex(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

fn hsl_to_hex(hue: u32, saturation: f64, lightness: f64) -> String {
    let c = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let h = hue as f64 / 60.0;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match hue / 60 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = lightness - c / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}
