// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;

use crate::params::{
    set_conv_filter_from_fwhm, ApertureShape, MultiAlgorithm, Parameters, SearchParity,
};

/// The built-in parameter profiles, in catalog order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockProfile {
    FastSolving,
    ParallelSolving,
    ParallelLargeScale,
    ParallelSmallScale,
    AllStars,
    SmallSizedStars,
    MidSizedStars,
    BigSizedStars,
}

impl StockProfile {
    pub const ALL: [StockProfile; 8] = [
        StockProfile::FastSolving,
        StockProfile::ParallelSolving,
        StockProfile::ParallelLargeScale,
        StockProfile::ParallelSmallScale,
        StockProfile::AllStars,
        StockProfile::SmallSizedStars,
        StockProfile::MidSizedStars,
        StockProfile::BigSizedStars,
    ];

    pub fn list_name(self) -> &'static str {
        match self {
            StockProfile::FastSolving => "FastSolving",
            StockProfile::ParallelSolving => "ParallelSolving",
            StockProfile::ParallelLargeScale => "ParallelLargeScale",
            StockProfile::ParallelSmallScale => "ParallelSmallScale",
            StockProfile::AllStars => "AllStars",
            StockProfile::SmallSizedStars => "SmallSizedStars",
            StockProfile::MidSizedStars => "MidSizedStars",
            StockProfile::BigSizedStars => "BigSizedStars",
        }
    }

    pub fn parameters(self) -> Parameters {
        let mut p = Parameters {
            list_name: self.list_name().into(),
            ..Parameters::default()
        };
        match self {
            StockProfile::FastSolving => {
                p.downsample = 2;
                p.min_width = 1.0;
                p.max_width = 10.0;
                p.keep_num = 50;
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 4.0);
            }
            StockProfile::ParallelSolving => {
                p.multi_algorithm = MultiAlgorithm::MultiAuto;
                p.downsample = 2;
                p.min_width = 1.0;
                p.max_width = 10.0;
                p.keep_num = 50;
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 2.0);
            }
            StockProfile::ParallelLargeScale => {
                p.multi_algorithm = MultiAlgorithm::MultiAuto;
                p.downsample = 2;
                p.min_width = 1.0;
                p.max_width = 10.0;
                p.keep_num = 50;
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 2.0);
            }
            StockProfile::ParallelSmallScale => {
                p.multi_algorithm = MultiAlgorithm::MultiAuto;
                p.downsample = 2;
                p.min_width = 1.0;
                p.max_width = 10.0;
                p.keep_num = 50;
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 2.0);
            }
            StockProfile::AllStars => {
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 1.0);
                p.r_min = 2.0;
            }
            StockProfile::SmallSizedStars => {
                p.max_ellipse = 1.5;
                set_conv_filter_from_fwhm(&mut p, 1.0);
                p.r_min = 2.0;
                p.max_size = 5.0;
                p.saturation_limit = 80.0;
            }
            StockProfile::MidSizedStars => {
                p.max_ellipse = 1.5;
                p.minarea = 20;
                set_conv_filter_from_fwhm(&mut p, 4.0);
                p.r_min = 5.0;
                p.remove_dimmest = 20.0;
                p.min_size = 2.0;
                p.max_size = 10.0;
                p.saturation_limit = 80.0;
            }
            StockProfile::BigSizedStars => {
                p.max_ellipse = 1.5;
                p.minarea = 40;
                set_conv_filter_from_fwhm(&mut p, 8.0);
                p.r_min = 20.0;
                p.min_size = 5.0;
                p.remove_dimmest = 50.0;
            }
        }
        p
    }
}

/// All built-in profiles in catalog order.
pub fn built_in_profiles() -> Vec<Parameters> {
    StockProfile::ALL.iter().map(|p| p.parameters()).collect()
}

/// Serializes parameters to a flat string-keyed map for persistence. The
/// convolution filter becomes a comma-joined decimal list.
pub fn parameters_to_map(params: &Parameters) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        map.insert(k.to_string(), v);
    };
    put("listName", params.list_name.clone());

    put(
        "apertureShape",
        (match params.aperture_shape {
            ApertureShape::Auto => 0,
            ApertureShape::Circle => 1,
            ApertureShape::Ellipse => 2,
        })
        .to_string(),
    );
    put("kron_fact", params.kron_fact.to_string());
    put("subpix", params.subpix.to_string());
    put("r_min", params.r_min.to_string());

    put("magzero", params.magzero.to_string());
    put("minarea", params.minarea.to_string());
    put("deblend_thresh", params.deblend_thresh.to_string());
    put("deblend_contrast", params.deblend_contrast.to_string());
    put("clean", params.clean.to_string());
    put("clean_param", params.clean_param.to_string());

    put("fwhm", params.fwhm.to_string());
    let conv: Vec<String> = params.conv_filter.iter().map(|v| v.to_string()).collect();
    put("convFilter", conv.join(","));

    put("maxSize", params.max_size.to_string());
    put("minSize", params.min_size.to_string());
    put("maxEllipse", params.max_ellipse.to_string());
    put("keepNum", params.keep_num.to_string());
    put("removeBrightest", params.remove_brightest.to_string());
    put("removeDimmest", params.remove_dimmest.to_string());
    put("saturationLimit", params.saturation_limit.to_string());

    put(
        "multiAlgo",
        (match params.multi_algorithm {
            MultiAlgorithm::NotMulti => 0,
            MultiAlgorithm::MultiScales => 1,
            MultiAlgorithm::MultiDepths => 2,
            MultiAlgorithm::MultiAuto => 3,
        })
        .to_string(),
    );
    put("inParallel", params.in_parallel.to_string());
    put("solverTimeLimit", params.solver_time_limit.to_string());
    put("minwidth", params.min_width.to_string());
    put("maxwidth", params.max_width.to_string());

    put("resort", params.resort.to_string());
    put("downsample", params.downsample.to_string());
    put("search_parity", params.search_parity.as_code().to_string());
    put("search_radius", params.search_radius.to_string());

    put("logratio_tokeep", params.logratio_tokeep.to_string());
    put("logratio_totune", params.logratio_totune.to_string());
    put("logratio_tosolve", params.logratio_tosolve.to_string());

    map
}

/// Rebuilds parameters from a map produced by [`parameters_to_map`].
/// Missing or unparseable keys keep their defaults; unknown keys are
/// ignored.
pub fn parameters_from_map(map: &BTreeMap<String, String>) -> Parameters {
    let mut p = Parameters::default();

    fn get<T: std::str::FromStr>(map: &BTreeMap<String, String>, key: &str, default: T) -> T {
        map.get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    if let Some(name) = map.get("listName") {
        p.list_name = name.clone();
    }

    p.aperture_shape = match get(map, "apertureShape", 1u8) {
        0 => ApertureShape::Auto,
        2 => ApertureShape::Ellipse,
        _ => ApertureShape::Circle,
    };
    p.kron_fact = get(map, "kron_fact", p.kron_fact);
    p.subpix = get(map, "subpix", p.subpix);
    p.r_min = get(map, "r_min", p.r_min);

    p.magzero = get(map, "magzero", p.magzero);
    p.minarea = get(map, "minarea", p.minarea);
    p.deblend_thresh = get(map, "deblend_thresh", p.deblend_thresh);
    p.deblend_contrast = get(map, "deblend_contrast", p.deblend_contrast);
    p.clean = get(map, "clean", p.clean);
    p.clean_param = get(map, "clean_param", p.clean_param);

    p.fwhm = get(map, "fwhm", p.fwhm);
    if let Some(conv) = map.get("convFilter") {
        let filter: Vec<f32> = conv.split(',').filter_map(|s| s.trim().parse().ok()).collect();
        if !filter.is_empty() {
            p.conv_filter = filter;
        }
    }

    p.max_size = get(map, "maxSize", p.max_size);
    p.min_size = get(map, "minSize", p.min_size);
    p.max_ellipse = get(map, "maxEllipse", p.max_ellipse);
    p.keep_num = get(map, "keepNum", p.keep_num);
    p.remove_brightest = get(map, "removeBrightest", p.remove_brightest);
    p.remove_dimmest = get(map, "removeDimmest", p.remove_dimmest);
    p.saturation_limit = get(map, "saturationLimit", p.saturation_limit);

    p.multi_algorithm = match get(map, "multiAlgo", 0u8) {
        1 => MultiAlgorithm::MultiScales,
        2 => MultiAlgorithm::MultiDepths,
        3 => MultiAlgorithm::MultiAuto,
        _ => MultiAlgorithm::NotMulti,
    };
    p.in_parallel = get(map, "inParallel", p.in_parallel);
    p.solver_time_limit = get(map, "solverTimeLimit", p.solver_time_limit);
    p.min_width = get(map, "minwidth", p.min_width);
    p.max_width = get(map, "maxwidth", p.max_width);

    p.resort = get(map, "resort", p.resort);
    p.downsample = get(map, "downsample", p.downsample);
    p.search_parity = SearchParity::from_code(get(map, "search_parity", p.search_parity.as_code()));
    p.search_radius = get(map, "search_radius", p.search_radius);

    p.logratio_tokeep = get(map, "logratio_tokeep", p.logratio_tokeep);
    p.logratio_totune = get(map, "logratio_totune", p.logratio_totune);
    p.logratio_tosolve = get(map, "logratio_tosolve", p.logratio_tosolve);

    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ScaleUnits;

    #[test]
    fn test_profile_names_unique_and_ordered() {
        let profiles = built_in_profiles();
        assert_eq!(profiles.len(), 8);
        assert_eq!(profiles[0].list_name, "FastSolving");
        assert_eq!(profiles[7].list_name, "BigSizedStars");
        let mut names: Vec<&str> = profiles.iter().map(|p| p.list_name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_each_parallel_profile_sets_its_own_widths() {
        for profile in [
            StockProfile::ParallelSolving,
            StockProfile::ParallelLargeScale,
            StockProfile::ParallelSmallScale,
        ] {
            let p = profile.parameters();
            assert_eq!(p.min_width, 1.0, "{}", p.list_name);
            assert_eq!(p.max_width, 10.0, "{}", p.list_name);
            assert_eq!(p.multi_algorithm, MultiAlgorithm::MultiAuto);
        }
    }

    #[test]
    fn test_map_round_trip_is_identity() {
        let mut p = StockProfile::MidSizedStars.parameters();
        p.search_parity = SearchParity::Negative;
        p.solver_time_limit = 123;
        p.logratio_tosolve = 7.25;
        let map = parameters_to_map(&p);
        let back = parameters_from_map(&map);
        assert_eq!(p, back);
    }

    #[test]
    fn test_round_trip_preserves_conv_filter_exactly() {
        let p = StockProfile::BigSizedStars.parameters();
        let back = parameters_from_map(&parameters_to_map(&p));
        assert_eq!(p.conv_filter, back.conv_filter);
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let mut map = BTreeMap::new();
        map.insert("keepNum".to_string(), "25".to_string());
        map.insert("someFutureKey".to_string(), "whatever".to_string());
        let p = parameters_from_map(&map);
        assert_eq!(p.keep_num, 25);
        // Everything else keeps its default.
        let defaults = Parameters::default();
        assert_eq!(p.min_width, defaults.min_width);
        assert_eq!(p.conv_filter, defaults.conv_filter);
        assert_eq!(p.list_name, defaults.list_name);
    }

    #[test]
    fn test_empty_map_yields_defaults() {
        let p = parameters_from_map(&BTreeMap::new());
        assert_eq!(p, Parameters::default());
    }

    #[test]
    fn test_unit_strings() {
        assert_eq!(ScaleUnits::DegWidth.unit_string(), "degwidth");
        assert_eq!(ScaleUnits::ArcsecPerPix.unit_string(), "arcsecperpix");
    }
}
