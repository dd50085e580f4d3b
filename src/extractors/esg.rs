// src/extractors/esg.rs

// --- Imports ---
use crate::storage::{AttachmentRef, StorageManager};
use crate::utils::error::ExtractError;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// --- Attachment catalog ---
// Each named section holds at most one base64 PDF payload at a fixed
// structural location inside the FRE XML.
const PDF_ELEMENT: &str = "ImagemObjetoArquivoPdf";

const ATTACHMENT_SECTIONS: &[(&str, &str)] = &[
    ("info_asg", "InfoASG"),
    ("programa_integridade", "ProgramaIntegridade"),
    ("gestao_riscos", "DescricaoGerenciamentoRiscos"),
    ("controles_internos", "DescricaoControlesInternos"),
    ("recursos_humanos", "DescricaoRH"),
    ("fatores_risco", "DescricaoFatoresRisco"),
    ("fatores_risco_principais", "Descricao5PrincipaisFatoresRisco"),
    ("historico", "HistoricoEmissor"),
    ("atividades_controladas", "AtividadesEmissorControladas"),
    ("segmentos_operacionais", "InfoSegmentosOperacionais"),
    ("producao_mercados", "ProducaoComercializacaoMercados"),
    ("regulacao_estatal", "EfeitosRegulacaoEstatal"),
    ("economia_mista", "InfoSociedadeEconomiaMista"),
    ("alteracoes_negocios", "AlteracoesNegocios"),
    ("plano_negocios", "PlanoNegocios"),
    ("caracteristicas_orgaos", "CaracteristicasOrgaosAdmECF"),
    ("conselho_adm", "InformacoesConselhoAdm"),
    ("politica_remuneracao", "PoliticaPraticaRemuneracao"),
    ("remuneracao_empregados", "RemuneracaoEmpregados"),
];

// --- Quantitative-row element names (FRE wire format) ---
const BOARD_RACE_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioAssembleiaGeralEAdmDescricaoCaracteristicasOrgaosAdmECFCorRaca";
const BOARD_GENDER_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioAssembleiaGeralEAdmDescricaoCaracteristicasOrgaosAdmECFGenero";
const BOARD_NAME_ELEMENT: &str = "OrgaoAdministracao";
const WORKFORCE_RACE_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioRecursosHumanosDescricaoRHEmissorCorRaca";
const WORKFORCE_GENDER_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioRecursosHumanosDescricaoRHEmissorGenero";
const WORKFORCE_AGE_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioRecursosHumanosDescricaoRHEmissorFaixaEtaria";
const WORKFORCE_REGION_ROW: &str =
    "XmlFormularioReferenciaDadosFREFormularioRecursosHumanosDescricaoRHEmissorLocalizacaoGeografica";
const COMPENSATION_ROW: &str = "RemuneracaoEmpregadosEst";

// --- Data Structures ---

/// Headcount by declared race/color category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceBreakdown {
    pub yellow: u32,
    pub white: u32,
    pub black: u32,
    pub brown: u32,
    pub indigenous: u32,
    pub other: u32,
    pub undeclared: u32,
}

/// Headcount by declared gender category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenderBreakdown {
    pub male: u32,
    pub female: u32,
    pub non_binary: u32,
    pub other: u32,
    pub undeclared: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBreakdown {
    pub under_30: u32,
    pub from_30_to_50: u32,
    pub over_50: u32,
}

/// Headcount by Brazilian macro-region, plus abroad.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBreakdown {
    pub north: u32,
    pub northeast: u32,
    pub midwest: u32,
    pub southeast: u32,
    pub south: u32,
    pub abroad: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStats {
    pub highest: f64,
    pub median: f64,
    pub ratio: f64,
}

/// Diversity of one named governing body. Race and gender are reported
/// as independent repeated rows correlated by the body name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDiversity {
    pub body: String,
    pub race: Option<RaceBreakdown>,
    pub gender: Option<GenderBreakdown>,
}

/// Company-wide workforce demographics and compensation statistics.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkforceProfile {
    pub race: Option<RaceBreakdown>,
    pub gender: Option<GenderBreakdown>,
    pub age: Option<AgeBreakdown>,
    pub region: Option<RegionBreakdown>,
    pub compensation: Option<CompensationStats>,
}

/// The full extraction result for one filing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsgPayload {
    pub extracted_at: DateTime<Utc>,
    pub attachments: BTreeMap<String, AttachmentRef>,
    pub board_diversity: Vec<BoardDiversity>,
    pub workforce: WorkforceProfile,
}

/// Loads a filing XML from disk, decoding the legacy Windows-1252
/// codepage the CVM systems emit. Decoding as UTF-8 corrupts every
/// accented company and body name.
pub fn load_filing_xml(path: &Path) -> Result<String, ExtractError> {
    let raw = std::fs::read(path)?;
    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(&raw);
    if had_errors {
        tracing::warn!(
            "Filing XML {} contained bytes invalid for Windows-1252",
            path.display()
        );
    }
    Ok(text.into_owned())
}

// --- Main Extractor Structure ---
pub struct EsgExtractor<'a> {
    storage: &'a StorageManager,
    cod_cvm: u32,
}

impl<'a> EsgExtractor<'a> {
    pub fn new(storage: &'a StorageManager, cod_cvm: u32) -> Self {
        Self { storage, cod_cvm }
    }

    /// Runs both extraction passes over one parsed filing.
    ///
    /// A parse failure is fatal for the attempt; a malformed individual
    /// attachment or field is logged and skipped.
    pub fn extract(&self, xml_text: &str) -> Result<EsgPayload, ExtractError> {
        tracing::info!("Extracting ESG data for issuer {}", self.cod_cvm);
        let doc = Document::parse(xml_text)?;

        let payload = EsgPayload {
            extracted_at: Utc::now(),
            attachments: self.extract_attachments(&doc),
            board_diversity: extract_board_diversity(&doc),
            workforce: extract_workforce_profile(&doc),
        };

        tracing::info!(
            "Extraction complete for issuer {}: {} attachments, {} governing bodies",
            self.cod_cvm,
            payload.attachments.len(),
            payload.board_diversity.len()
        );
        Ok(payload)
    }

    /// Attachment pass: for each cataloged section, decode its single
    /// base64 PDF payload and store it content-addressed.
    fn extract_attachments(&self, doc: &Document) -> BTreeMap<String, AttachmentRef> {
        let mut attachments = BTreeMap::new();

        for (section, tag) in ATTACHMENT_SECTIONS {
            let Some(payload) = doc
                .descendants()
                .find(|n| n.has_tag_name(*tag))
                .and_then(|n| n.children().find(|c| c.has_tag_name(PDF_ELEMENT)))
                .and_then(|n| n.text())
            else {
                continue;
            };

            // Payloads may be wrapped with whitespace/newlines.
            let compact: String = payload.split_whitespace().collect();
            if compact.is_empty() {
                continue;
            }

            let content = match base64::engine::general_purpose::STANDARD.decode(&compact) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Invalid base64 payload in section {}: {}", section, e);
                    continue;
                }
            };

            match self.storage.save_attachment(self.cod_cvm, section, &content) {
                Ok(reference) => {
                    attachments.insert(section.to_string(), reference);
                }
                Err(e) => tracing::error!("Failed to store attachment for {}: {}", section, e),
            }
        }

        attachments
    }
}

/// Field pass, governance: two independent row sets (race, gender) are
/// correlated by governing-body name. The second pass finds-or-creates
/// the record keyed by that name instead of duplicating it.
fn extract_board_diversity(doc: &Document) -> Vec<BoardDiversity> {
    let mut order: Vec<String> = Vec::new();
    let mut by_body: HashMap<String, BoardDiversity> = HashMap::new();

    let mut entry_for = |order: &mut Vec<String>,
                         by_body: &mut HashMap<String, BoardDiversity>,
                         body: &str|
     -> String {
        if !by_body.contains_key(body) {
            order.push(body.to_string());
            by_body.insert(
                body.to_string(),
                BoardDiversity {
                    body: body.to_string(),
                    race: None,
                    gender: None,
                },
            );
        }
        body.to_string()
    };

    for row in doc.descendants().filter(|n| n.has_tag_name(BOARD_RACE_ROW)) {
        let Some(body) = child_text(&row, BOARD_NAME_ELEMENT) else {
            tracing::warn!("Board race row without {} element, skipping", BOARD_NAME_ELEMENT);
            continue;
        };
        let key = entry_for(&mut order, &mut by_body, &body);
        if let Some(record) = by_body.get_mut(&key) {
            record.race = Some(RaceBreakdown {
                yellow: child_u32(&row, "Amarelo"),
                white: child_u32(&row, "Branco"),
                black: child_u32(&row, "Preto"),
                brown: child_u32(&row, "Pardo"),
                indigenous: child_u32(&row, "Indigena"),
                other: child_u32(&row, "Outros"),
                undeclared: child_u32(&row, "PrefereNaoResponder"),
            });
        }
    }

    for row in doc.descendants().filter(|n| n.has_tag_name(BOARD_GENDER_ROW)) {
        let Some(body) = child_text(&row, BOARD_NAME_ELEMENT) else {
            tracing::warn!("Board gender row without {} element, skipping", BOARD_NAME_ELEMENT);
            continue;
        };
        let key = entry_for(&mut order, &mut by_body, &body);
        if let Some(record) = by_body.get_mut(&key) {
            record.gender = Some(GenderBreakdown {
                male: child_u32(&row, "Masculino"),
                female: child_u32(&row, "Feminino"),
                non_binary: child_u32(&row, "NaoBinario"),
                other: child_u32(&row, "Outros"),
                undeclared: child_u32(&row, "PrefereNaoResponder"),
            });
        }
    }

    order
        .into_iter()
        .filter_map(|body| by_body.remove(&body))
        .collect()
}

/// Field pass, workforce: company-wide breakdowns. Every block is
/// optional; the compensation row uses the `Est` (statistics) element.
fn extract_workforce_profile(doc: &Document) -> WorkforceProfile {
    let mut profile = WorkforceProfile::default();

    if let Some(row) = doc.descendants().find(|n| n.has_tag_name(WORKFORCE_RACE_ROW)) {
        profile.race = Some(RaceBreakdown {
            yellow: child_u32(&row, "Amarelo"),
            white: child_u32(&row, "Branco"),
            black: child_u32(&row, "Preto"),
            // The workforce block spells this category differently from
            // the governance block.
            brown: child_u32(&row, "Parda"),
            indigenous: child_u32(&row, "Indigena"),
            other: child_u32(&row, "Outros"),
            undeclared: child_u32(&row, "PrefiroNaoResponder"),
        });
    }

    if let Some(row) = doc.descendants().find(|n| n.has_tag_name(WORKFORCE_GENDER_ROW)) {
        profile.gender = Some(GenderBreakdown {
            male: child_u32(&row, "Masculino"),
            female: child_u32(&row, "Feminino"),
            non_binary: child_u32(&row, "NaoBinario"),
            other: child_u32(&row, "Outros"),
            undeclared: child_u32(&row, "PrefiroNaoResponder"),
        });
    }

    if let Some(row) = doc.descendants().find(|n| n.has_tag_name(WORKFORCE_AGE_ROW)) {
        profile.age = Some(AgeBreakdown {
            under_30: child_u32(&row, "FaixaAbaixo30"),
            from_30_to_50: child_u32(&row, "FaixaDe30a50"),
            over_50: child_u32(&row, "FaixaAcima50"),
        });
    }

    if let Some(row) = doc.descendants().find(|n| n.has_tag_name(WORKFORCE_REGION_ROW)) {
        profile.region = Some(RegionBreakdown {
            north: child_u32(&row, "Norte"),
            northeast: child_u32(&row, "Nordeste"),
            midwest: child_u32(&row, "CentroOeste"),
            southeast: child_u32(&row, "Sudeste"),
            south: child_u32(&row, "Sul"),
            abroad: child_u32(&row, "Exterior"),
        });
    }

    if let Some(row) = doc.descendants().find(|n| n.has_tag_name(COMPENSATION_ROW)) {
        profile.compensation = Some(CompensationStats {
            highest: child_f64(&row, "RemuneracaoMaior"),
            median: child_f64(&row, "RemuneracaoMediana"),
            ratio: child_f64(&row, "RazaoRemuneracoes"),
        });
    }

    profile
}

// --- Leaf helpers ---
// Absent or unparsable numeric leaves yield zero; extraction never fails
// on an optional field.

fn child_text(node: &Node, tag: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn child_u32(node: &Node, tag: &str) -> u32 {
    child_text(node, tag)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

fn child_f64(node: &Node, tag: &str) -> f64 {
    child_text(node, tag)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0.0)
}
