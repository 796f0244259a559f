// THEORY (1D Pixel Heuristics):
// The `Pixel` module is the smallest unit of the visibility engine. It holds one
// RGB sample and the single-pixel heuristics the estimator builds on. Nothing here
// reads a neighbour: gradients live in the estimator, region averages live in
// `smart_region`.
//
// Heuristic families:
// - Brightness: luminance (Rec. 601), used for contrast, Sobel edges and the
//   brightness diagnostic.
// - Spread: standard deviation across R,G,B. Haze and fog pull every channel
//   toward the same grey, so a falling spread is a cheap desaturation signal.
// - Colorimetry: sRGB → linear (LUT) → XYZ (D65) → CIELAB, used for the
//   reference-region ΔE baseline.
//
// The sRGB→linear conversion uses a 256-entry `OnceLock` LUT; the hot path is a
// table lookup, no `powf` per pixel.

pub mod pixel {
    use serde::{Deserialize, Serialize};
    use std::sync::OnceLock;

    pub type Channel = u8;
    pub type NormalizedChannel = f32;
    pub type Luminance = f64;
    pub type ChannelStdDev = f64;

    pub const CHANNELS: usize = 3;

    // D65 reference white.
    const WHITE_X: f64 = 0.950_47;
    const WHITE_Y: f64 = 1.0;
    const WHITE_Z: f64 = 1.088_83;

    static SRGB_TO_LINEAR_LUT: OnceLock<[NormalizedChannel; 256]> = OnceLock::new();

    /// One RGB sample as decoded from the stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Pixel {
        pub red: Channel,
        pub green: Channel,
        pub blue: Channel,
    }

    impl From<&[u8]> for Pixel {
        /// Takes the first three bytes as R, G, B. Shorter slices read as black.
        fn from(bytes: &[u8]) -> Self {
            match bytes {
                [r, g, b, ..] => Pixel::new(*r, *g, *b),
                _ => Pixel::default(),
            }
        }
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel) -> Self {
            Pixel { red, green, blue }
        }

        #[inline]
        fn srgb_to_linear(srgb_value: Channel) -> NormalizedChannel {
            let table = SRGB_TO_LINEAR_LUT.get_or_init(|| {
                let mut table = [0.0f32; 256];
                for (i, slot) in table.iter_mut().enumerate() {
                    let srgb_normalized = i as NormalizedChannel / 255.0;
                    *slot = if srgb_normalized <= 0.04045 {
                        srgb_normalized / 12.92
                    } else {
                        ((srgb_normalized + 0.055) / 1.055).powf(2.4)
                    };
                }
                table
            });
            table[srgb_value as usize]
        }

        /// =================================Heuristics==================================

        /// Luminance estimate (Rec. 601 luma), 0..255.
        #[inline]
        pub fn luminance(&self) -> Luminance {
            0.299 * self.red as f64 + 0.587 * self.green as f64 + 0.114 * self.blue as f64
        }

        /// Population standard deviation across the three channels, 0..~120.
        /// Grey pixels score 0.
        #[inline]
        pub fn channel_stddev(&self) -> ChannelStdDev {
            let r = self.red as f64;
            let g = self.green as f64;
            let b = self.blue as f64;
            let mean = (r + g + b) / 3.0;
            let variance = ((r - mean).powi(2) + (g - mean).powi(2) + (b - mean).powi(2)) / 3.0;
            variance.sqrt()
        }

        /// CIELAB (D65) coordinates of this pixel.
        pub fn to_lab(&self) -> Lab {
            let r = Self::srgb_to_linear(self.red) as f64;
            let g = Self::srgb_to_linear(self.green) as f64;
            let b = Self::srgb_to_linear(self.blue) as f64;

            let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
            let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
            let z = 0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b;

            let fx = lab_f(x / WHITE_X);
            let fy = lab_f(y / WHITE_Y);
            let fz = lab_f(z / WHITE_Z);

            Lab {
                l: 116.0 * fy - 16.0,
                a: 500.0 * (fx - fy),
                b: 200.0 * (fy - fz),
            }
        }
    }

    #[inline]
    fn lab_f(t: f64) -> f64 {
        const EPSILON: f64 = 216.0 / 24_389.0;
        const KAPPA: f64 = 24_389.0 / 27.0;
        if t > EPSILON {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    }

    /// A CIELAB colour. `l` in 0..100, `a`/`b` roughly -128..128.
    #[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
    pub struct Lab {
        pub l: f64,
        pub a: f64,
        pub b: f64,
    }

    impl Lab {
        /// CIE76 colour difference (Euclidean distance in Lab).
        pub fn delta_e(&self, other: &Lab) -> f64 {
            ((self.l - other.l).powi(2) + (self.a - other.a).powi(2) + (self.b - other.b).powi(2))
                .sqrt()
        }

        /// Moves this colour toward `sample` by `weight` (0..1). Used for running means.
        pub fn blend(&self, sample: &Lab, weight: f64) -> Lab {
            Lab {
                l: self.l + (sample.l - self.l) * weight,
                a: self.a + (sample.a - self.a) * weight,
                b: self.b + (sample.b - self.b) * weight,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn grey_has_no_channel_spread() {
            let grey = Pixel::new(128, 128, 128);
            assert_eq!(grey.channel_stddev(), 0.0);
            assert!((grey.luminance() - 128.0).abs() < 1e-9);
        }

        #[test]
        fn saturated_red_has_large_spread() {
            let red = Pixel::new(255, 0, 0);
            assert!(red.channel_stddev() > 100.0);
        }

        #[test]
        fn lab_extremes() {
            let white = Pixel::new(255, 255, 255).to_lab();
            assert!((white.l - 100.0).abs() < 0.1);
            assert!(white.a.abs() < 0.1 && white.b.abs() < 0.1);

            let black = Pixel::new(0, 0, 0).to_lab();
            assert!(black.l.abs() < 1e-6);
            assert!((white.delta_e(&black) - 100.0).abs() < 0.1);
        }

        #[test]
        fn slice_conversion_reads_rgb() {
            let bytes = [10u8, 20, 30];
            assert_eq!(Pixel::from(&bytes[..]), Pixel::new(10, 20, 30));
            assert_eq!(Pixel::from(&bytes[..2]), Pixel::default());
        }

        #[test]
        fn blend_moves_toward_sample() {
            let a = Lab { l: 0.0, a: 0.0, b: 0.0 };
            let b = Lab { l: 10.0, a: -10.0, b: 4.0 };
            let half = a.blend(&b, 0.5);
            assert_eq!(half, Lab { l: 5.0, a: -5.0, b: 2.0 });
        }
    }
}
