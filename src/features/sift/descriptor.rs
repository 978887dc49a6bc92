use super::detect::angle_deg;
use super::pyramid::Plane;

/// Spatial bins per side of the descriptor window.
pub const DESCR_WIDTH: usize = 4;
/// Orientation bins per spatial bin.
pub const DESCR_HIST_BINS: usize = 8;
/// Length of a SIFT descriptor.
pub const DESCRIPTOR_SIZE: usize = DESCR_WIDTH * DESCR_WIDTH * DESCR_HIST_BINS;

const DESCR_SCL_FCTR: f32 = 3.0;
const DESCR_MAG_THR: f32 = 0.2;
const INT_DESCR_FCTR: f32 = 512.0;

/// Compute the 128 wide gradient histogram descriptor of a keypoint.
///
/// `pt` is `(x, y)` and `scl` the keypoint radius, both in the coordinates of
/// `img`; `ori` is in degrees. Values are saturated to `0..=255`.
pub fn calc_descriptor(img: &Plane, pt: (f32, f32), ori: f32, scl: f32) -> [f32; DESCRIPTOR_SIZE] {
    let d = DESCR_WIDTH;
    let n = DESCR_HIST_BINS;
    let (rows, cols) = img.shape();
    let (px, py) = (pt.0.round() as isize, pt.1.round() as isize);

    let (sin_t, cos_t) = ori.to_radians().sin_cos();
    let bins_per_deg = n as f32 / 360.0;
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = DESCR_SCL_FCTR * scl;
    let diagonal = ((cols * cols + rows * rows) as f64).sqrt() as isize;
    let radius = ((hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5).round() as isize)
        .min(diagonal);
    let (cos_t, sin_t) = (cos_t / hist_width, sin_t / hist_width);

    let plane = (d + 2) * (n + 2);
    let mut hist = vec![0f32; (d + 2) * plane];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + (d / 2) as f32 - 0.5;
            let cbin = c_rot + (d / 2) as f32 - 0.5;
            let r = py + i;
            let c = px + j;

            if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                continue;
            }
            if r <= 0 || r >= rows as isize - 1 || c <= 0 || c >= cols as isize - 1 {
                continue;
            }
            let (r, c) = (r as usize, c as usize);
            let dx = img[(r, c + 1)] - img[(r, c - 1)];
            let dy = img[(r - 1, c)] - img[(r + 1, c)];
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let mag = (dx * dx + dy * dy).sqrt() * weight;
            let obin = (angle_deg(dy, dx) - ori) * bins_per_deg;

            let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
            let (rbin, cbin, obin) = (rbin - r0, cbin - c0, obin - o0);
            let mut o0 = o0 as isize;
            if o0 < 0 {
                o0 += n as isize;
            }
            if o0 >= n as isize {
                o0 -= n as isize;
            }

            // trilinear interpolation over (row, col, orientation)
            let v_r1 = mag * rbin;
            let v_r0 = mag - v_r1;
            let v_rc11 = v_r1 * cbin;
            let v_rc10 = v_r1 - v_rc11;
            let v_rc01 = v_r0 * cbin;
            let v_rc00 = v_r0 - v_rc01;
            let v_rco111 = v_rc11 * obin;
            let v_rco110 = v_rc11 - v_rco111;
            let v_rco101 = v_rc10 * obin;
            let v_rco100 = v_rc10 - v_rco101;
            let v_rco011 = v_rc01 * obin;
            let v_rco010 = v_rc01 - v_rco011;
            let v_rco001 = v_rc00 * obin;
            let v_rco000 = v_rc00 - v_rco001;

            let idx = (((r0 as isize + 1) as usize * (d + 2) + (c0 as isize + 1) as usize) * (n + 2))
                + o0 as usize;
            hist[idx] += v_rco000;
            hist[idx + 1] += v_rco001;
            hist[idx + (n + 2)] += v_rco010;
            hist[idx + (n + 3)] += v_rco011;
            hist[idx + plane] += v_rco100;
            hist[idx + plane + 1] += v_rco101;
            hist[idx + plane + (n + 2)] += v_rco110;
            hist[idx + plane + (n + 3)] += v_rco111;
        }
    }

    let mut dst = [0f32; DESCRIPTOR_SIZE];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                dst[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }
    normalize(&mut dst);
    dst
}

/// Unit-normalise, clip large components, renormalise and quantise to a byte range.
fn normalize(dst: &mut [f32; DESCRIPTOR_SIZE]) {
    let norm = dst.iter().map(|v| v * v).sum::<f32>().sqrt();
    let thr = norm * DESCR_MAG_THR;
    dst.iter_mut().for_each(|v| *v = v.min(thr));

    let norm = dst.iter().map(|v| v * v).sum::<f32>().sqrt();
    let scale = INT_DESCR_FCTR / norm.max(f32::EPSILON);
    dst.iter_mut()
        .for_each(|v| *v = (*v * scale).round().max(0.0).min(255.0));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_patch() -> Plane {
        Plane::from_fn(40, 40, |r, c| ((r as f32 * 0.3).sin() + (c as f32 * 0.2).cos()) * 60.0 + 128.0)
    }

    #[test]
    fn descriptor_is_byte_ranged_and_not_empty() {
        let d = calc_descriptor(&gradient_patch(), (20.0, 20.0), 0.0, 3.0);
        assert!(d.iter().all(|v| (0.0..=255.0).contains(v) && v.fract() == 0.0));
        assert!(d.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn flat_patch_gives_zero_descriptor() {
        let img = Plane::from_element(30, 30, 100.0);
        let d = calc_descriptor(&img, (15.0, 15.0), 45.0, 2.0);
        assert!(d.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn descriptor_is_deterministic() {
        let img = gradient_patch();
        let a = calc_descriptor(&img, (18.0, 22.0), 30.0, 2.5);
        let b = calc_descriptor(&img, (18.0, 22.0), 30.0, 2.5);
        assert_eq!(a.to_vec(), b.to_vec());
    }
}
