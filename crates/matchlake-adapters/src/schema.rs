//! Default declared schema for the Riot match table.

use matchlake_core::{
    EVENT_DATE_COLUMN, MATCH_ID_COLUMN, PARTICIPANT_ID_COLUMN, PLAYER_COLUMN,
};
use matchlake_storage::{LogicalType, SchemaField, TableSchema};

const OPTIONAL_METADATA: &[(&str, LogicalType)] = &[
    ("metadata.dataversion", LogicalType::String),
    ("metadata.platformid", LogicalType::String),
    ("metadata.gameid", LogicalType::Long),
    ("metadata.gamename", LogicalType::String),
    ("metadata.gametype", LogicalType::String),
    ("metadata.mapid", LogicalType::Int),
    ("metadata.gamestarttimestamp", LogicalType::Long),
    ("metadata.gameendtimestamp", LogicalType::Long),
    ("metadata.endofgameresult", LogicalType::String),
    ("metadata.tournamentcode", LogicalType::String),
];

const OPTIONAL_PARTICIPANT: &[(&str, LogicalType)] = &[
    ("participant.participantid", LogicalType::Int),
    ("participant.riotidgamename", LogicalType::String),
    ("participant.riotidtagline", LogicalType::String),
    ("participant.summonername", LogicalType::String),
    ("participant.championid", LogicalType::Int),
    ("participant.championname", LogicalType::String),
    ("participant.champlevel", LogicalType::Int),
    ("participant.teamid", LogicalType::Int),
    ("participant.teamposition", LogicalType::String),
    ("participant.individualposition", LogicalType::String),
    ("participant.lane", LogicalType::String),
    ("participant.role", LogicalType::String),
    ("participant.win", LogicalType::Boolean),
    ("participant.kills", LogicalType::Int),
    ("participant.deaths", LogicalType::Int),
    ("participant.assists", LogicalType::Int),
    ("participant.firstbloodkill", LogicalType::Boolean),
    ("participant.goldearned", LogicalType::Int),
    ("participant.goldspent", LogicalType::Int),
    ("participant.totalminionskilled", LogicalType::Int),
    ("participant.neutralminionskilled", LogicalType::Int),
    ("participant.totaldamagedealttochampions", LogicalType::Long),
    ("participant.damagedealttoobjectives", LogicalType::Long),
    ("participant.damagedealttoturrets", LogicalType::Long),
    ("participant.totaldamagetaken", LogicalType::Long),
    ("participant.visionscore", LogicalType::Int),
    ("participant.wardsplaced", LogicalType::Int),
    ("participant.wardskilled", LogicalType::Int),
    ("participant.visionwardsboughtingame", LogicalType::Int),
    ("participant.timeccingothers", LogicalType::Int),
    ("participant.timeplayed", LogicalType::Int),
    ("participant.summoner1id", LogicalType::Int),
    ("participant.summoner2id", LogicalType::Int),
    ("participant.item0", LogicalType::Int),
    ("participant.item1", LogicalType::Int),
    ("participant.item2", LogicalType::Int),
    ("participant.item3", LogicalType::Int),
    ("participant.item4", LogicalType::Int),
    ("participant.item5", LogicalType::Int),
    ("participant.item6", LogicalType::Int),
];

fn perks_type() -> LogicalType {
    let stat_perks = LogicalType::struct_of(vec![
        SchemaField::optional("defense", LogicalType::Int),
        SchemaField::optional("flex", LogicalType::Int),
        SchemaField::optional("offense", LogicalType::Int),
    ]);
    let selection = LogicalType::struct_of(vec![
        SchemaField::optional("perk", LogicalType::Int),
        SchemaField::optional("var1", LogicalType::Int),
        SchemaField::optional("var2", LogicalType::Int),
        SchemaField::optional("var3", LogicalType::Int),
    ]);
    let style = LogicalType::struct_of(vec![
        SchemaField::optional("description", LogicalType::String),
        SchemaField::optional("selections", LogicalType::list_of(selection)),
        SchemaField::optional("style", LogicalType::Int),
    ]);
    LogicalType::struct_of(vec![
        SchemaField::optional("statperks", stat_perks),
        SchemaField::optional("styles", LogicalType::list_of(style)),
    ])
}

/// Schema the `init-table` bootstrap declares for `lol_raw.data_api_mining`.
pub fn riot_match_table_schema() -> TableSchema {
    let mut fields = vec![
        SchemaField::required(PLAYER_COLUMN, LogicalType::String),
        SchemaField::required(EVENT_DATE_COLUMN, LogicalType::Date),
        SchemaField::required(MATCH_ID_COLUMN, LogicalType::String),
        SchemaField::required("metadata.gamecreation", LogicalType::Long),
        SchemaField::required("metadata.gameduration", LogicalType::Long),
        SchemaField::required("metadata.gamemode", LogicalType::String),
        SchemaField::required("metadata.queueid", LogicalType::Int),
        SchemaField::required("metadata.gameversion", LogicalType::String),
        SchemaField::optional(
            "metadata.participants",
            LogicalType::list_of(LogicalType::String),
        ),
    ];
    fields.extend(
        OPTIONAL_METADATA
            .iter()
            .map(|(name, ty)| SchemaField::optional(*name, ty.clone())),
    );
    fields.push(SchemaField::required(PARTICIPANT_ID_COLUMN, LogicalType::String));
    fields.extend(
        OPTIONAL_PARTICIPANT
            .iter()
            .map(|(name, ty)| SchemaField::optional(*name, ty.clone())),
    );
    fields.push(SchemaField::optional(
        "participant.challenges",
        LogicalType::map_of(LogicalType::String, LogicalType::Double),
    ));
    fields.push(SchemaField::optional(
        "participant.missions",
        LogicalType::map_of(LogicalType::String, LogicalType::Long),
    ));
    fields.push(SchemaField::optional("participant.perks", perks_type()));
    TableSchema::new(fields)
}
